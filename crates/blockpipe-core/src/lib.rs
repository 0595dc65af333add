//! blockpipe-core — query planning, transformer composition and the fork-aware
//! streaming engine for blockchain block data.
//!
//! # Architecture
//!
//! ```text
//! StreamBuilder → StreamEngine::run(sink)
//!                      ├── QueryBuilder   (fields + range-scoped requests → plan)
//!                      ├── Portal         (head, fetch, fork signal)
//!                      ├── CacheAdapter   (replay of finalized batches)
//!                      ├── normalize_batch (field-selection validation)
//!                      ├── Transformer    (Pipe / Composite stage graph)
//!                      ├── resolve_fork   (safe resume cursor after a reorg)
//!                      └── Sink           (lazy batch stream, rollback, persisted state)
//! ```

pub mod builder;
pub mod cache;
pub mod cancel;
pub mod checkpoint;
pub mod composite;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod fork;
pub mod logging;
pub mod portal;
pub mod profiler;
pub mod progress;
pub mod query;
pub mod range;
pub mod retry;
pub mod schema;
pub mod sink;
pub mod transformer;

pub use builder::StreamBuilder;
pub use cache::{CacheAdapter, CachedBatch, MemoryCache};
pub use cancel::{CancelHandle, CancelSignal};
pub use checkpoint::{MemoryStateStore, StateRecord, StateStore};
pub use composite::Composite;
pub use config::{StreamConfig, DEFAULT_STREAM_ID};
pub use cursor::{BlockCursor, PipelineState};
pub use engine::{BlockBatch, StreamEngine};
pub use error::{NormalizeError, ParseError, PipeError, PlanError, PortalError, TransformError};
pub use fork::{resolve_fork, ForkHistory};
pub use logging::{init_tracing, LogConfig};
pub use portal::{FetchRequest, ForkInfo, Portal, RawBatch};
pub use profiler::{Profiler, StageTiming};
pub use progress::Progress;
pub use query::{merge_data_requests, query_hash, DataRequest, PlanEntry, QueryBuilder, RequestEntry};
pub use range::{parse_bound, BlockRange, Range, RangeBound, RangeLimit};
pub use retry::{RetryConfig, RetryPolicy};
pub use schema::{normalize_batch, Block, BlockHeader, FieldSelection};
pub use sink::{Batch, BatchContext, BatchStream, BatchWriter, CheckpointedSink, MemoryWriter, Sink};
pub use transformer::{BoxTransformer, FnTransformer, Pipe, StageContext, Transformer, TransformerExt};
