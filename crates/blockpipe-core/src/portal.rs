//! The `Portal` trait — the abstract block-data service the engine pulls from.
//!
//! The wire client itself lives outside this crate. The engine only needs a
//! head lookup and a range fetch that can signal a chain fork.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::BlockCursor;
use crate::error::PortalError;
use crate::query::DataRequest;
use crate::schema::FieldSelection;

/// One physical fetch issued by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// First block to return (inclusive).
    pub from_block: u64,
    /// Last block to return (inclusive). `None` streams up to the head.
    pub to_block: Option<u64>,
    /// Hash the portal must find as the parent of `from_block`, if known.
    ///
    /// A mismatch is reported as [`PortalError::Fork`].
    pub parent_block_hash: Option<String>,
    pub fields: FieldSelection,
    pub request: DataRequest,
}

/// Raw bytes of one batch plus the portal's view of finality.
#[derive(Debug, Clone, Default)]
pub struct RawBatch {
    /// JSON lines, one block object per line. Empty means no new blocks yet.
    pub data: Bytes,
    /// Latest block the portal declared irreversible when serving this batch.
    pub finalized: Option<BlockCursor>,
}

impl RawBatch {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            finalized: None,
        }
    }

    pub fn with_finalized(mut self, finalized: BlockCursor) -> Self {
        self.finalized = Some(finalized);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(u8::is_ascii_whitespace)
    }
}

/// Payload of a fork signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkInfo {
    /// The portal's canonical ancestry, ascending by number.
    pub previous_blocks: Vec<BlockCursor>,
    /// `from_block` of the rejected request.
    pub from_block: u64,
    /// `parent_block_hash` of the rejected request.
    pub parent_block_hash: Option<String>,
}

/// The block-data service consumed by the engine.
///
/// Implementations must be `Send + Sync` so one portal can be shared across
/// streams as `Arc<dyn Portal>`.
#[async_trait]
pub trait Portal: Send + Sync {
    /// Current chain head.
    async fn head(&self) -> Result<BlockCursor, PortalError>;

    /// Latest finalized block, when the portal tracks finality.
    async fn finalized_head(&self) -> Result<Option<BlockCursor>, PortalError> {
        Ok(None)
    }

    /// First block at or after `timestamp`.
    async fn block_at_timestamp(&self, _timestamp: DateTime<Utc>) -> Result<u64, PortalError> {
        Err(PortalError::Unsupported("timestamp lookups"))
    }

    /// Fetch the next batch for `request`.
    ///
    /// The portal may return fewer blocks than requested; the engine resumes
    /// from the last block it receives.
    async fn fetch(&self, request: &FetchRequest) -> Result<RawBatch, PortalError>;
}
