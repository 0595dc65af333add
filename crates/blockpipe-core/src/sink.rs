//! Sink contract and the checkpointed reference sink.
//!
//! The engine hands a sink one lazy [`BatchStream`] per stream lifetime. The
//! sink pulls batches at its own pace, so backpressure is sink-driven: the
//! next batch is not produced until the sink asks for it.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::checkpoint::{StateRecord, StateStore};
use crate::cursor::{BlockCursor, PipelineState};
use crate::error::PipeError;
use crate::fork::{resolve_fork, ForkHistory};
use crate::range::BlockRange;

// ─── Batches ─────────────────────────────────────────────────────────────────

/// Where a batch sits in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContext {
    pub stream_id: Arc<str>,
    /// Pipeline state after this batch is committed.
    pub state: PipelineState,
    /// Blocks delivered in this batch.
    pub range: BlockRange,
    /// Cache key of the request that produced the batch.
    pub query_hash: String,
}

/// Transformed data plus its context.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    pub data: T,
    pub ctx: BatchContext,
}

/// The lazy batch sequence handed to [`Sink::write`].
pub type BatchStream<T> = BoxStream<'static, Result<Batch<T>, PipeError>>;

// ─── Sink ────────────────────────────────────────────────────────────────────

/// Downstream target of a stream.
#[async_trait]
pub trait Sink<T: Send + 'static>: Send + Sync {
    /// Restore previously persisted state, if the sink owns any.
    async fn load_state(&self, _stream_id: &str) -> Result<Option<PipelineState>, PipeError> {
        Ok(None)
    }

    /// Returns `true` if the sink persists cursor state across restarts.
    fn is_persistent(&self) -> bool {
        false
    }

    /// Consume the batch stream. Called once per stream lifetime.
    ///
    /// Errors yielded by the stream must be returned, not swallowed.
    async fn write(&self, batches: BatchStream<T>) -> Result<(), PipeError>;

    /// Roll back after a chain fork.
    ///
    /// `local` is the engine's in-memory state; `previous_blocks` the portal's
    /// canonical ancestry. Returns the safe cursor the stream resumes from,
    /// `None` if there is none. Sinks that cannot roll back keep the default,
    /// which stops the stream with a configuration error.
    async fn fork(
        &self,
        _stream_id: &str,
        _local: &PipelineState,
        _previous_blocks: &[BlockCursor],
    ) -> Result<Option<BlockCursor>, PipeError> {
        Err(PipeError::ForkUnsupported)
    }
}

// ─── Checkpointed sink ───────────────────────────────────────────────────────

/// Writes batch data to an external target.
#[async_trait]
pub trait BatchWriter<T: Send + 'static>: Send + Sync {
    async fn write_batch(&self, batch: Batch<T>) -> Result<(), PipeError>;

    /// Delete everything written for blocks above `block`.
    async fn rollback_after(&self, stream_id: &str, block: u64) -> Result<(), PipeError>;
}

/// Persistent sink: data goes to a [`BatchWriter`], every committed state is
/// appended to a [`StateStore`], and forks are resolved against the stored
/// history.
pub struct CheckpointedSink<W, T> {
    writer: W,
    store: Arc<dyn StateStore>,
    fork_history: usize,
    _marker: PhantomData<fn(T)>,
}

impl<W, T> CheckpointedSink<W, T>
where
    W: BatchWriter<T>,
    T: Send + 'static,
{
    pub fn new(writer: W, store: Arc<dyn StateStore>) -> Self {
        Self {
            writer,
            store,
            fork_history: 16,
            _marker: PhantomData,
        }
    }

    /// Number of stored snapshots consulted when resolving a fork.
    pub fn with_fork_history(mut self, snapshots: usize) -> Self {
        self.fork_history = snapshots;
        self
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }
}

#[async_trait]
impl<W, T> Sink<T> for CheckpointedSink<W, T>
where
    W: BatchWriter<T>,
    T: Send + 'static,
{
    async fn load_state(&self, stream_id: &str) -> Result<Option<PipelineState>, PipeError> {
        Ok(self.store.load(stream_id).await?.map(|record| record.state))
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn write(&self, mut batches: BatchStream<T>) -> Result<(), PipeError> {
        while let Some(batch) = batches.next().await {
            let batch = batch?;
            let record = StateRecord::new(&*batch.ctx.stream_id, batch.ctx.state.clone());
            self.writer.write_batch(batch).await?;
            self.store.save(record).await?;
        }
        Ok(())
    }

    async fn fork(
        &self,
        stream_id: &str,
        local: &PipelineState,
        previous_blocks: &[BlockCursor],
    ) -> Result<Option<BlockCursor>, PipeError> {
        let stored = self.store.history(stream_id, self.fork_history).await?;
        let mut histories = Vec::with_capacity(stored.len() + 1);
        histories.push(ForkHistory::from(local));
        histories.extend(stored.iter().map(|record| ForkHistory::from(&record.state)));

        let Some(safe) = resolve_fork(&histories, previous_blocks) else {
            return Ok(None);
        };

        self.writer.rollback_after(stream_id, safe.number).await?;
        self.store.truncate_after(stream_id, safe.number).await?;

        let mut rewound = local.clone();
        rewound.rewind_to(&safe);
        self.store.save(StateRecord::new(stream_id, rewound)).await?;

        tracing::info!(
            stream = stream_id,
            safe = safe.number,
            hash = %safe.hash,
            "Sink rolled back"
        );
        Ok(Some(safe))
    }
}

// ─── In-memory writer ────────────────────────────────────────────────────────

/// Trims the part of a batch's data above a block number.
pub type TruncateFn<T> = Arc<dyn Fn(&mut T, u64) + Send + Sync>;

/// Collects batch data in memory.
///
/// On rollback, batches entirely above the safe block are dropped; a batch
/// straddling it is trimmed with the truncate function, if one is set.
pub struct MemoryWriter<T> {
    batches: Mutex<Vec<(BlockRange, T)>>,
    truncate: Option<TruncateFn<T>>,
}

impl<T> Default for MemoryWriter<T> {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            truncate: None,
        }
    }
}

impl<T: Clone> MemoryWriter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_truncate(truncate: impl Fn(&mut T, u64) + Send + Sync + 'static) -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            truncate: Some(Arc::new(truncate)),
        }
    }

    /// Data of every batch written so far, in order.
    pub fn data(&self) -> Vec<T> {
        self.batches
            .lock()
            .map(|b| b.iter().map(|(_, data)| data.clone()).collect())
            .unwrap_or_default()
    }

    /// Block ranges of every batch written so far, in order.
    pub fn ranges(&self) -> Vec<BlockRange> {
        self.batches
            .lock()
            .map(|b| b.iter().map(|(range, _)| *range).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl<T: Send + 'static> BatchWriter<T> for MemoryWriter<T> {
    async fn write_batch(&self, batch: Batch<T>) -> Result<(), PipeError> {
        let mut batches = self
            .batches
            .lock()
            .map_err(|_| PipeError::Sink("writer lock poisoned".into()))?;
        batches.push((batch.ctx.range, batch.data));
        Ok(())
    }

    async fn rollback_after(&self, _stream_id: &str, block: u64) -> Result<(), PipeError> {
        let mut batches = self
            .batches
            .lock()
            .map_err(|_| PipeError::Sink("writer lock poisoned".into()))?;
        batches.retain(|(range, _)| range.from <= block);
        for (range, data) in batches.iter_mut() {
            if range.to.map_or(true, |to| to > block) {
                range.to = Some(block);
                if let Some(truncate) = &self.truncate {
                    truncate(data, block);
                }
            }
        }
        Ok(())
    }
}
