//! Cache adapter contract and the in-memory reference store.
//!
//! Entries are keyed by `(query_hash, from, to)` and hold the raw batch bytes
//! exactly as the portal returned them. Replaying from the cache skips the
//! network round trip for ranges that were already fetched.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::PipeError;

/// One cached batch covering `[from, to]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBatch {
    pub from: u64,
    pub to: u64,
    #[serde(with = "serde_bytes_hex")]
    pub data: Bytes,
}

/// Key-addressed range store.
///
/// A cache must only be shared between streams through disjoint query hashes.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// Lazily replay consecutive batches starting exactly at block `from`.
    ///
    /// The stream is finite: it ends at the first gap.
    async fn stream(
        &self,
        query_hash: &str,
        from: u64,
    ) -> Result<BoxStream<'static, Result<CachedBatch, PipeError>>, PipeError>;

    /// Store the raw bytes of `[from, to]` under `query_hash`.
    async fn save(&self, query_hash: &str, from: u64, to: u64, data: Bytes) -> Result<(), PipeError>;
}

// ─── In-memory cache ─────────────────────────────────────────────────────────

type Entries = BTreeMap<(String, u64), CachedBatch>;

/// In-memory cache for tests and short-lived streams.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<Entries>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(entries: &Mutex<Entries>, query_hash: &str, from: u64) -> Result<Option<CachedBatch>, PipeError> {
        let entries = entries
            .lock()
            .map_err(|_| PipeError::Cache("cache lock poisoned".into()))?;
        Ok(entries.get(&(query_hash.to_string(), from)).cloned())
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    async fn stream(
        &self,
        query_hash: &str,
        from: u64,
    ) -> Result<BoxStream<'static, Result<CachedBatch, PipeError>>, PipeError> {
        let entries = self.entries.clone();
        let query_hash = query_hash.to_string();
        let batches = stream::unfold(Some(from), move |next| {
            let entries = entries.clone();
            let query_hash = query_hash.clone();
            async move {
                let from = next?;
                match Self::lookup(&entries, &query_hash, from) {
                    Ok(Some(batch)) => {
                        let next = batch.to.checked_add(1);
                        Some((Ok(batch), next))
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(e), None)),
                }
            }
        });
        Ok(batches.boxed())
    }

    async fn save(&self, query_hash: &str, from: u64, to: u64, data: Bytes) -> Result<(), PipeError> {
        if to < from {
            return Err(PipeError::Cache(format!("invalid cache range [{from}, {to}]")));
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| PipeError::Cache("cache lock poisoned".into()))?;
        entries.insert((query_hash.to_string(), from), CachedBatch { from, to, data });
        Ok(())
    }
}

mod serde_bytes_hex {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map(Bytes::from).map_err(serde::de::Error::custom)
    }
}
