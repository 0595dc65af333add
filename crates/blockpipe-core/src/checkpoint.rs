//! Persisted pipeline state — an append-only log of committed states.
//!
//! Each committed batch appends one snapshot. On restart the newest snapshot
//! restores the cursor; on a fork the recent snapshots feed fork resolution
//! and everything above the safe cursor is truncated away.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::PipelineState;
use crate::error::PipeError;

/// A persisted state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub stream_id: String,
    pub state: PipelineState,
    pub saved_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(stream_id: impl Into<String>, state: PipelineState) -> Self {
        Self {
            stream_id: stream_id.into(),
            state,
            saved_at: Utc::now(),
        }
    }
}

/// Storage for state snapshots, partitioned by stream id.
///
/// Implementations include [`MemoryStateStore`] and the SQLite store in
/// `blockpipe-storage`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Newest snapshot of `stream_id`.
    async fn load(&self, stream_id: &str) -> Result<Option<StateRecord>, PipeError>;

    /// Up to `limit` snapshots, newest first.
    async fn history(&self, stream_id: &str, limit: usize) -> Result<Vec<StateRecord>, PipeError>;

    /// Append a snapshot.
    async fn save(&self, record: StateRecord) -> Result<(), PipeError>;

    /// Drop every snapshot whose cursor is above `block`.
    async fn truncate_after(&self, stream_id: &str, block: u64) -> Result<(), PipeError>;

    /// Drop all snapshots of `stream_id`.
    async fn delete(&self, stream_id: &str) -> Result<(), PipeError>;
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// In-memory state log for tests and ephemeral streams.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    data: Mutex<HashMap<String, Vec<StateRecord>>>,
    /// Keep at most this many snapshots per stream (0 = unbounded).
    retain: usize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only the newest `retain` snapshots per stream.
    pub fn with_retention(retain: usize) -> Self {
        Self {
            retain,
            ..Self::default()
        }
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<StateRecord>>>, PipeError> {
        self.data
            .lock()
            .map_err(|_| PipeError::Storage("state store lock poisoned".into()))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, stream_id: &str) -> Result<Option<StateRecord>, PipeError> {
        Ok(self.locked()?.get(stream_id).and_then(|log| log.last().cloned()))
    }

    async fn history(&self, stream_id: &str, limit: usize) -> Result<Vec<StateRecord>, PipeError> {
        Ok(self
            .locked()?
            .get(stream_id)
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn save(&self, record: StateRecord) -> Result<(), PipeError> {
        let mut data = self.locked()?;
        let log = data.entry(record.stream_id.clone()).or_default();
        log.push(record);
        if self.retain > 0 && log.len() > self.retain {
            let excess = log.len() - self.retain;
            log.drain(..excess);
        }
        Ok(())
    }

    async fn truncate_after(&self, stream_id: &str, block: u64) -> Result<(), PipeError> {
        if let Some(log) = self.locked()?.get_mut(stream_id) {
            log.retain(|r| r.state.cursor.number <= block);
        }
        Ok(())
    }

    async fn delete(&self, stream_id: &str) -> Result<(), PipeError> {
        self.locked()?.remove(stream_id);
        Ok(())
    }
}
