//! Fluent builder API for creating streams.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use blockpipe_core::{BlockBatch, Portal, Range, StreamBuilder, transformer::from_fn};
//! # fn example(portal: Arc<dyn Portal>) -> Result<(), blockpipe_core::PipeError> {
//! let engine = StreamBuilder::new()
//!     .id("usdc-transfers")
//!     .portal(portal)
//!     .request("logs", Range::from_block(19_000_000), serde_json::json!({"address": ["0xa0b8…"]}))
//!     .poll_interval_ms(1_000)
//!     .build(from_fn("count", |batch: BlockBatch| Ok(batch.len())))?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use serde_json::Value;

use crate::cache::CacheAdapter;
use crate::cancel::CancelSignal;
use crate::config::StreamConfig;
use crate::engine::{BlockBatch, StreamEngine};
use crate::error::PipeError;
use crate::portal::Portal;
use crate::profiler::Profiler;
use crate::progress::{log_progress, Progress, ProgressHook};
use crate::query::QueryBuilder;
use crate::range::Range;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::schema::FieldSelection;
use crate::transformer::Transformer;

/// Fluent builder for [`StreamEngine`].
#[derive(Default)]
pub struct StreamBuilder {
    config: StreamConfig,
    portal: Option<Arc<dyn Portal>>,
    query: QueryBuilder,
    cache: Option<Arc<dyn CacheAdapter>>,
    progress_hook: Option<ProgressHook>,
    cancel: CancelSignal,
    profiler: Profiler,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the stream id (used for persisted state and diagnostics).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    pub fn portal(mut self, portal: Arc<dyn Portal>) -> Self {
        self.portal = Some(portal);
        self
    }

    /// Merge a prepared query.
    pub fn query(mut self, query: QueryBuilder) -> Self {
        self.query.merge(query);
        self
    }

    pub fn fields(mut self, fields: FieldSelection) -> Self {
        self.query.add_fields(&fields);
        self
    }

    pub fn request(mut self, kind: impl Into<String>, range: Range, filter: Value) -> Self {
        self.query.add_request(kind, range, filter);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheAdapter>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Maximum number of recent cursors kept for fork resolution.
    pub fn rollback_depth(mut self, depth: usize) -> Self {
        self.config.rollback_depth = depth;
        self
    }

    /// Wait between polls once caught up with the head, in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn progress_interval_ms(mut self, ms: u64) -> Self {
        self.config.progress_interval_ms = ms;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Replace the default progress hook (an `info` log line).
    pub fn on_progress(mut self, hook: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        self.progress_hook = Some(Arc::new(hook));
        self
    }

    pub fn cancel_on(mut self, signal: CancelSignal) -> Self {
        self.cancel = signal;
        self
    }

    /// Share a profiler, e.g. across several streams.
    pub fn profiler(mut self, profiler: Profiler) -> Self {
        self.profiler = profiler;
        self
    }

    /// Build the engine with `transformer` as the root stage.
    pub fn build<X>(self, transformer: X) -> Result<StreamEngine<X::Output>, PipeError>
    where
        X: Transformer<Input = BlockBatch> + 'static,
    {
        let portal = self
            .portal
            .ok_or_else(|| PipeError::Config("a portal is required".into()))?;
        self.config.validate()?;

        Ok(StreamEngine {
            retry: RetryPolicy::new(self.config.retry.clone()),
            config: self.config,
            portal,
            query: self.query,
            cache: self.cache,
            transformer: Arc::new(transformer),
            progress_hook: self.progress_hook.unwrap_or_else(|| Arc::new(log_progress)),
            cancel: self.cancel,
            profiler: self.profiler,
        })
    }
}
