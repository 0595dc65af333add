//! `StreamEngine` — the restartable, fork-aware pull loop.
//!
//! The batch stream handed to the sink is an explicit state machine:
//!
//! ```text
//! Idle → Planning → Fetching → Normalizing → Transforming → Committing ─┐
//!          ▲           │                                                │
//!          │           └──────────── Forking ◄── fork signal            │
//!          └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each sink pull advances the machine until one batch is committed. The
//! cancellation signal is checked between states, so a batch is either fully
//! committed or not produced at all.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, info, warn};

use crate::cache::{CacheAdapter, CachedBatch};
use crate::cancel::CancelSignal;
use crate::config::StreamConfig;
use crate::cursor::{BlockCursor, PipelineState};
use crate::error::{PipeError, PortalError, TransformError};
use crate::portal::{FetchRequest, ForkInfo, Portal, RawBatch};
use crate::profiler::Profiler;
use crate::progress::{spawn_reporter, ProgressHook, ProgressTracker};
use crate::query::{PlanEntry, QueryBuilder};
use crate::range::{BlockRange, RangeLimit};
use crate::retry::RetryPolicy;
use crate::schema::{normalize_batch, Block};
use crate::sink::{Batch, BatchContext, BatchStream, Sink};
use crate::transformer::{run_transform, StageContext, Transformer};

/// Input of the root transformer: normalized blocks of one batch.
#[derive(Debug, Clone)]
pub struct BlockBatch {
    pub blocks: Arc<[Block]>,
    /// First and last block of the batch.
    pub range: BlockRange,
    /// Latest finalized block reported alongside the batch.
    pub finalized: Option<BlockCursor>,
}

impl BlockBatch {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// The root stage of a stream.
pub type RootTransformer<T> = Arc<dyn Transformer<Input = BlockBatch, Output = T>>;

/// A configured stream, ready to run against a sink.
pub struct StreamEngine<T: Send + 'static> {
    pub(crate) config: StreamConfig,
    pub(crate) portal: Arc<dyn Portal>,
    pub(crate) query: QueryBuilder,
    pub(crate) cache: Option<Arc<dyn CacheAdapter>>,
    pub(crate) transformer: RootTransformer<T>,
    pub(crate) retry: RetryPolicy,
    pub(crate) progress_hook: ProgressHook,
    pub(crate) cancel: CancelSignal,
    pub(crate) profiler: Profiler,
}

impl<T: Send + 'static> StreamEngine<T> {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Timings of every stage call made by this stream.
    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Run the stream to completion.
    ///
    /// Returns once every bounded range is processed, the stream is cancelled,
    /// or a fatal error occurs. `stop` hooks always run once `start` was
    /// attempted; the first error wins.
    pub async fn run(self, sink: Arc<dyn Sink<T>>) -> Result<(), PipeError> {
        self.config.validate()?;
        if sink.is_persistent() && self.config.has_default_id() {
            return Err(PipeError::Config(format!(
                "a persistent sink needs an explicit stream id, not the default '{}'",
                self.config.id
            )));
        }

        let stream_id: Arc<str> = Arc::from(self.config.id.as_str());
        let ctx = StageContext::new(stream_id.clone(), self.profiler.clone());

        let mut query = self.query.clone();
        self.transformer.query(&mut query, &ctx).await?;
        if query.is_empty() {
            return Err(PipeError::Config(
                "no data requested: add a request to the query or a query hook".into(),
            ));
        }
        if query.has_timestamps() {
            query.resolve_timestamps(&*self.portal).await?;
        }

        let state = sink.load_state(&stream_id).await?;
        match &state {
            Some(s) => info!(stream = %stream_id, cursor = %s.cursor, "Resuming stream"),
            None => info!(stream = %stream_id, "Starting stream"),
        }

        let result = self.drive(sink, query, state, &ctx).await;

        let stopped = self.transformer.stop(&ctx).await.map_err(PipeError::from);
        match &result {
            Ok(()) => info!(stream = %stream_id, "Stream finished"),
            Err(e) => warn!(stream = %stream_id, error = %e, "Stream failed"),
        }
        result.and(stopped)
    }

    /// Start hooks, progress reporter, then hand the batch stream to the sink.
    async fn drive(
        &self,
        sink: Arc<dyn Sink<T>>,
        query: QueryBuilder,
        state: Option<PipelineState>,
        ctx: &StageContext,
    ) -> Result<(), PipeError> {
        self.transformer.start(ctx).await?;

        let progress = ProgressTracker::new(ctx.stream_id.to_string());
        let reporter = spawn_reporter(
            progress.subscribe(),
            self.config.progress_interval(),
            self.progress_hook.clone(),
        );

        let driver = Driver {
            stream_id: ctx.stream_id.clone(),
            config: self.config.clone(),
            portal: self.portal.clone(),
            cache: self.cache.clone(),
            transformer: self.transformer.clone(),
            sink: sink.clone(),
            retry: self.retry.clone(),
            query,
            ctx: ctx.clone(),
            state,
            progress,
            progress_started: false,
            cancel: self.cancel.clone(),
            replay: None,
            phase: EngineState::Idle { wait: None },
        };
        let written = sink.write(driver.into_stream()).await;
        // The tracker went down with the stream; let the reporter flush.
        if let Err(e) = reporter.await {
            if e.is_panic() {
                warn!(stream = %ctx.stream_id, error = %e, "Progress reporter panicked");
            }
        }
        written
    }
}

// ─── State machine ───────────────────────────────────────────────────────────

/// Bytes fetched from the network, kept until commit for cache write-back.
struct Fetched {
    from: u64,
    data: Bytes,
}

enum EngineState<T> {
    /// Waiting before the next plan; `None` means no wait.
    Idle { wait: Option<Duration> },
    Planning,
    Fetching {
        entry: PlanEntry,
        query_hash: String,
    },
    Normalizing {
        entry: PlanEntry,
        query_hash: String,
        raw: RawBatch,
        fetched: Option<Fetched>,
    },
    Transforming {
        query_hash: String,
        blocks: Vec<Block>,
        finalized: Option<BlockCursor>,
        fetched: Option<Fetched>,
    },
    Committing {
        query_hash: String,
        batch: BlockBatch,
        data: T,
        fetched: Option<Fetched>,
    },
    Forking(ForkInfo),
    Done,
}

impl<T> EngineState<T> {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle { .. } => "idle",
            Self::Planning => "planning",
            Self::Fetching { .. } => "fetching",
            Self::Normalizing { .. } => "normalizing",
            Self::Transforming { .. } => "transforming",
            Self::Committing { .. } => "committing",
            Self::Forking(_) => "forking",
            Self::Done => "done",
        }
    }
}

/// An open cache replay, reused while batches stay consecutive.
struct Replay {
    query_hash: String,
    next: u64,
    batches: BoxStream<'static, Result<CachedBatch, PipeError>>,
}

struct Driver<T: Send + 'static> {
    stream_id: Arc<str>,
    config: StreamConfig,
    portal: Arc<dyn Portal>,
    cache: Option<Arc<dyn CacheAdapter>>,
    transformer: RootTransformer<T>,
    sink: Arc<dyn Sink<T>>,
    retry: RetryPolicy,
    query: QueryBuilder,
    ctx: StageContext,
    state: Option<PipelineState>,
    progress: ProgressTracker,
    progress_started: bool,
    cancel: CancelSignal,
    replay: Option<Replay>,
    phase: EngineState<T>,
}

impl<T: Send + 'static> Driver<T> {
    fn into_stream(self) -> BatchStream<T> {
        stream::try_unfold(self, |mut driver| async move {
            let next = driver.next_batch().await?;
            Ok::<_, PipeError>(next.map(|batch| (batch, driver)))
        })
        .boxed()
    }

    /// Advance until one batch is committed, the stream ends, or an error occurs.
    async fn next_batch(&mut self) -> Result<Option<Batch<T>>, PipeError> {
        loop {
            if self.cancel.is_cancelled() {
                if !matches!(self.phase, EngineState::Done) {
                    info!(stream = %self.stream_id, "Stream cancelled");
                }
                self.phase = EngineState::Done;
                return Ok(None);
            }

            let phase = std::mem::replace(&mut self.phase, EngineState::Done);
            tracing::trace!(stream = %self.stream_id, state = phase.name(), "Engine step");
            self.phase = match phase {
                EngineState::Idle { wait } => {
                    if let Some(wait) = wait {
                        let cancel = &mut self.cancel;
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                    EngineState::Planning
                }
                EngineState::Planning => self.plan().await?,
                EngineState::Fetching { entry, query_hash } => self.fetch(entry, query_hash).await?,
                EngineState::Normalizing {
                    entry,
                    query_hash,
                    raw,
                    fetched,
                } => self.normalize(&entry, query_hash, raw, fetched)?,
                EngineState::Transforming {
                    query_hash,
                    blocks,
                    finalized,
                    fetched,
                } => self.transform(query_hash, blocks, finalized, fetched).await?,
                EngineState::Committing {
                    query_hash,
                    batch,
                    data,
                    fetched,
                } => {
                    let batch = self.commit(query_hash, batch, data, fetched).await;
                    self.phase = EngineState::Planning;
                    return Ok(Some(batch));
                }
                EngineState::Forking(info) => self.fork(info).await?,
                EngineState::Done => return Ok(None),
            };
        }
    }

    async fn plan(&mut self) -> Result<EngineState<T>, PipeError> {
        let bound = RangeLimit {
            from: self.state.as_ref().map(|s| s.cursor.next_block()),
            to: None,
        };

        let head = if self.query.has_latest() && bound.from.is_none() {
            let portal = self.portal.clone();
            let head = self.retry.run("head", || portal.head()).await?;
            info!(stream = %self.stream_id, head = %head, "Resolved 'latest' against the portal head");
            self.query.pin_latest(head.number);
            Some(head)
        } else {
            None
        };

        let plan = self.query.calculate_ranges(head.as_ref(), &bound)?;
        let Some(entry) = plan.first().cloned() else {
            info!(stream = %self.stream_id, "All requested ranges processed");
            return Ok(EngineState::Done);
        };

        let target = plan.last().and_then(|e| e.range.to);
        if !self.progress_started {
            self.progress.reset(entry.range.from, target);
            self.progress_started = true;
            info!(
                stream = %self.stream_id,
                entries = plan.len(),
                from = entry.range.from,
                to = ?target,
                "Query planned"
            );
        } else {
            self.progress.set_target(target);
        }

        let query_hash = entry.query_hash(self.query.fields());
        Ok(EngineState::Fetching { entry, query_hash })
    }

    async fn fetch(&mut self, entry: PlanEntry, query_hash: String) -> Result<EngineState<T>, PipeError> {
        let from = entry.range.from;

        if let Some(cached) = self.replay_cached(&query_hash, from).await {
            debug!(stream = %self.stream_id, from = cached.from, to = cached.to, "Replaying cached batch");
            return Ok(EngineState::Normalizing {
                entry,
                query_hash,
                raw: RawBatch::new(cached.data),
                fetched: None,
            });
        }

        let request = FetchRequest {
            from_block: from,
            to_block: entry.range.to,
            parent_block_hash: self
                .state
                .as_ref()
                .filter(|s| s.cursor.next_block() == from)
                .map(|s| s.cursor.hash.clone()),
            fields: self.query.fields().clone(),
            request: entry.request.clone(),
        };

        let portal = self.portal.clone();
        match self.retry.run("fetch", || portal.fetch(&request)).await {
            Ok(mut raw) => {
                if raw.finalized.is_none() && self.cache.is_some() {
                    match self.portal.finalized_head().await {
                        Ok(finalized) => raw.finalized = finalized,
                        Err(e) => debug!(error = %e, "Finalized head unavailable"),
                    }
                }
                let fetched = Some(Fetched {
                    from,
                    data: raw.data.clone(),
                });
                Ok(EngineState::Normalizing {
                    entry,
                    query_hash,
                    raw,
                    fetched,
                })
            }
            Err(PipeError::Portal(PortalError::Fork(info))) => {
                warn!(
                    stream = %self.stream_id,
                    from_block = info.from_block,
                    parent = ?info.parent_block_hash,
                    "Chain fork detected"
                );
                Ok(EngineState::Forking(info))
            }
            Err(e) => Err(e),
        }
    }

    /// Next cached batch starting exactly at `from`, if any. Cache failures
    /// degrade to a network fetch.
    async fn replay_cached(&mut self, query_hash: &str, from: u64) -> Option<CachedBatch> {
        let cache = self.cache.clone()?;

        let reusable = matches!(&self.replay, Some(r) if r.query_hash == query_hash && r.next == from);
        if !reusable {
            self.replay = match cache.stream(query_hash, from).await {
                Ok(batches) => Some(Replay {
                    query_hash: query_hash.to_string(),
                    next: from,
                    batches,
                }),
                Err(e) => {
                    warn!(stream = %self.stream_id, error = %e, "Cache unavailable, fetching from portal");
                    None
                }
            };
        }

        let replay = self.replay.as_mut()?;
        match replay.batches.next().await {
            Some(Ok(batch)) if batch.from == from => {
                replay.next = batch.to.saturating_add(1);
                Some(batch)
            }
            Some(Err(e)) => {
                warn!(stream = %self.stream_id, error = %e, "Cache read failed, fetching from portal");
                self.replay = None;
                None
            }
            _ => {
                self.replay = None;
                None
            }
        }
    }

    fn normalize(
        &mut self,
        entry: &PlanEntry,
        query_hash: String,
        raw: RawBatch,
        fetched: Option<Fetched>,
    ) -> Result<EngineState<T>, PipeError> {
        let caught_up = EngineState::Idle {
            wait: Some(self.config.poll_interval()),
        };
        if raw.is_empty() {
            debug!(stream = %self.stream_id, from = entry.range.from, "Caught up with the portal");
            return Ok(caught_up);
        }

        let after = self.state.as_ref().map(|s| s.cursor.number);
        let blocks: Vec<Block> = normalize_batch(&raw.data, self.query.fields())?
            .into_iter()
            .filter(|b| entry.range.contains(b.header.number))
            .filter(|b| after.map_or(true, |n| b.header.number > n))
            .collect();
        if blocks.is_empty() {
            debug!(stream = %self.stream_id, from = entry.range.from, "No new blocks in batch");
            return Ok(caught_up);
        }

        Ok(EngineState::Transforming {
            query_hash,
            blocks,
            finalized: raw.finalized,
            fetched,
        })
    }

    async fn transform(
        &mut self,
        query_hash: String,
        blocks: Vec<Block>,
        finalized: Option<BlockCursor>,
        fetched: Option<Fetched>,
    ) -> Result<EngineState<T>, PipeError> {
        if !self.transformer.is_healthy() {
            return Err(TransformError::Unhealthy {
                stage: self.transformer.id().to_string(),
            }
            .into());
        }

        let first = blocks.first().map_or(0, |b| b.header.number);
        let last = blocks.last().map_or(first, |b| b.header.number);
        let batch = BlockBatch {
            blocks: blocks.into(),
            range: BlockRange::new(first, Some(last)),
            finalized,
        };

        let data = run_transform(&*self.transformer, self.transformer.id(), batch.clone(), &self.ctx).await?;
        Ok(EngineState::Committing {
            query_hash,
            batch,
            data,
            fetched,
        })
    }

    async fn commit(
        &mut self,
        query_hash: String,
        batch: BlockBatch,
        data: T,
        fetched: Option<Fetched>,
    ) -> Batch<T> {
        let cursors: Vec<BlockCursor> = batch.blocks.iter().map(Block::cursor).collect();
        let last = batch.range.to.unwrap_or(batch.range.from);

        let state = self
            .state
            .get_or_insert_with(|| PipelineState::new(cursors[0].clone()));
        state.commit(&cursors, batch.finalized.as_ref(), self.config.rollback_depth);
        let state = state.clone();

        if let (Some(cache), Some(fetched)) = (&self.cache, fetched) {
            let finalized = batch.finalized.as_ref().is_some_and(|f| last <= f.number);
            if finalized {
                if let Err(e) = cache.save(&query_hash, fetched.from, last, fetched.data).await {
                    warn!(stream = %self.stream_id, error = %e, "Cache write failed");
                }
            }
        }

        self.progress.update(last, cursors.len() as u64);
        debug!(
            stream = %self.stream_id,
            from = batch.range.from,
            to = last,
            blocks = cursors.len(),
            "Batch committed"
        );

        Batch {
            data,
            ctx: BatchContext {
                stream_id: self.stream_id.clone(),
                state,
                range: batch.range,
                query_hash,
            },
        }
    }

    async fn fork(&mut self, info: ForkInfo) -> Result<EngineState<T>, PipeError> {
        self.replay = None;
        let unresolved = || PipeError::UnresolvedFork {
            from_block: info.from_block,
            parent_hash: info.parent_block_hash.clone(),
        };

        let Some(local) = self.state.as_mut() else {
            return Err(unresolved());
        };
        let safe = self
            .sink
            .fork(&self.stream_id, local, &info.previous_blocks)
            .await?
            .ok_or_else(unresolved)?;

        local.rewind_to(&safe);
        self.transformer.fork(&safe, &self.ctx).await?;
        let target = self.progress_target();
        self.progress.reset(safe.next_block(), target);
        info!(
            stream = %self.stream_id,
            safe = safe.number,
            hash = %safe.hash,
            "Fork resolved, resuming"
        );
        Ok(EngineState::Planning)
    }

    fn progress_target(&self) -> Option<u64> {
        self.query
            .calculate_ranges(None, &RangeLimit::default())
            .ok()
            .and_then(|plan| plan.last().and_then(|e| e.range.to))
    }
}
