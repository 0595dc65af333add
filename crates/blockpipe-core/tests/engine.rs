//! End-to-end stream tests against a scripted in-memory portal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::json;

use blockpipe_core::{
    Batch, BatchStream, BatchWriter, BlockBatch, BlockCursor, CancelHandle, CheckpointedSink, FetchRequest, ForkInfo,
    MemoryCache, MemoryStateStore, MemoryWriter, PipeError, PipelineState, Portal, PortalError,
    Progress, Range, RangeBound, RawBatch, RetryConfig, Sink, StageContext, StateStore, StreamBuilder,
    TransformError, Transformer,
};

// ─── Scripted portal ─────────────────────────────────────────────────────────

struct Reorg {
    after_fetches: u32,
    from: u64,
}

/// A chain of `len` blocks. Hashes encode a generation so a reorg can swap them.
struct MockPortal {
    chain: Mutex<Vec<BlockCursor>>,
    batch_size: u64,
    finalized_lag: Option<u64>,
    transient_failures: AtomicU32,
    fetches: AtomicU32,
    reorg: Mutex<Option<Reorg>>,
    extra_header_field: bool,
}

fn block_hash(n: u64, generation: u32) -> String {
    format!("0x{n:04x}-{generation}")
}

impl MockPortal {
    fn new(len: u64) -> Self {
        Self {
            chain: Mutex::new((0..len).map(|n| BlockCursor::new(n, block_hash(n, 0))).collect()),
            batch_size: 10,
            finalized_lag: None,
            transient_failures: AtomicU32::new(0),
            fetches: AtomicU32::new(0),
            reorg: Mutex::new(None),
            extra_header_field: false,
        }
    }

    fn finalized_lag(mut self, lag: u64) -> Self {
        self.finalized_lag = Some(lag);
        self
    }

    fn fail_first(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    fn reorg_after(self, after_fetches: u32, from: u64) -> Self {
        *self.reorg.lock().unwrap() = Some(Reorg { after_fetches, from });
        self
    }

    fn with_extra_header_field(mut self) -> Self {
        self.extra_header_field = true;
        self
    }

    fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn hash_of(&self, n: u64) -> String {
        self.chain.lock().unwrap()[n as usize].hash.clone()
    }
}

#[async_trait]
impl Portal for MockPortal {
    async fn head(&self) -> Result<BlockCursor, PortalError> {
        let chain = self.chain.lock().unwrap();
        chain.last().cloned().ok_or_else(|| PortalError::Other("empty chain".into()))
    }

    async fn block_at_timestamp(&self, timestamp: DateTime<Utc>) -> Result<u64, PortalError> {
        // One block every 10 seconds from the epoch.
        Ok(((timestamp.timestamp() + 9) / 10) as u64)
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawBatch, PortalError> {
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PortalError::Transient("503 service unavailable".into()));
        }

        let fetch_no = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let mut chain = self.chain.lock().unwrap();

        let mut reorg = self.reorg.lock().unwrap();
        if reorg.as_ref().is_some_and(|r| fetch_no > r.after_fetches) {
            let from = reorg.take().map(|r| r.from).unwrap_or_default();
            for block in chain.iter_mut().filter(|b| b.number >= from) {
                block.hash = block_hash(block.number, 1);
            }
        }

        let from = request.from_block;
        if let Some(parent) = &request.parent_block_hash {
            let expected = &chain[(from - 1) as usize].hash;
            if parent != expected {
                let start = from.saturating_sub(10) as usize;
                return Err(PortalError::Fork(ForkInfo {
                    previous_blocks: chain[start..from as usize].to_vec(),
                    from_block: from,
                    parent_block_hash: Some(parent.clone()),
                }));
            }
        }

        let head = chain.len() as u64 - 1;
        let finalized = self
            .finalized_lag
            .map(|lag| chain[head.saturating_sub(lag) as usize].clone());
        if from > head {
            return Ok(RawBatch {
                data: Default::default(),
                finalized,
            });
        }

        let last = request
            .to_block
            .unwrap_or(head)
            .min(head)
            .min(from + self.batch_size - 1);
        let lines: Vec<String> = (from..=last)
            .map(|n| {
                let mut header = json!({"number": n, "hash": chain[n as usize].hash});
                if self.extra_header_field {
                    header["miner"] = json!("0xbeef");
                }
                json!({ "header": header }).to_string()
            })
            .collect();

        Ok(RawBatch {
            data: lines.join("\n").into(),
            finalized,
        })
    }
}

// ─── Stages and sinks ────────────────────────────────────────────────────────

/// Emits the block numbers of each batch and logs its lifecycle calls.
#[derive(Clone, Default)]
struct Numbers {
    log: Arc<Mutex<Vec<String>>>,
    fail_from: Option<u64>,
}

impl Numbers {
    /// Fail every batch reaching block `n`.
    fn failing_from(n: u64) -> Self {
        Self {
            fail_from: Some(n),
            ..Self::default()
        }
    }

    fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transformer for Numbers {
    type Input = BlockBatch;
    type Output = Vec<u64>;

    fn id(&self) -> &str {
        "numbers"
    }

    async fn start(&self, _ctx: &StageContext) -> Result<(), TransformError> {
        self.log.lock().unwrap().push("start".into());
        Ok(())
    }

    async fn stop(&self, _ctx: &StageContext) -> Result<(), TransformError> {
        self.log.lock().unwrap().push("stop".into());
        Ok(())
    }

    async fn fork(&self, cursor: &BlockCursor, _ctx: &StageContext) -> Result<(), TransformError> {
        self.log.lock().unwrap().push(format!("fork@{}", cursor.number));
        Ok(())
    }

    async fn transform(&self, input: BlockBatch, _ctx: &StageContext) -> Result<Vec<u64>, TransformError> {
        if let (Some(n), Some(last)) = (self.fail_from, input.range.to) {
            if last >= n {
                return Err(TransformError::stage("numbers", format!("cannot handle block {last}")));
            }
        }
        Ok(input.blocks.iter().map(|b| b.header.number).collect())
    }
}

type Checkpointed = CheckpointedSink<MemoryWriter<Vec<u64>>, Vec<u64>>;

fn checkpointed(store: &Arc<MemoryStateStore>) -> Arc<Checkpointed> {
    let writer = MemoryWriter::with_truncate(|data: &mut Vec<u64>, block| data.retain(|n| *n <= block));
    Arc::new(CheckpointedSink::new(writer, store.clone()))
}

fn written(sink: &Checkpointed) -> Vec<u64> {
    sink.writer().data().concat()
}

/// Rejects every batch starting at or above `fail_from`.
struct FailingWriter {
    inner: MemoryWriter<Vec<u64>>,
    fail_from: u64,
}

#[async_trait]
impl BatchWriter<Vec<u64>> for FailingWriter {
    async fn write_batch(&self, batch: Batch<Vec<u64>>) -> Result<(), PipeError> {
        if batch.ctx.range.from >= self.fail_from {
            return Err(PipeError::Sink("disk full".into()));
        }
        self.inner.write_batch(batch).await
    }

    async fn rollback_after(&self, stream_id: &str, block: u64) -> Result<(), PipeError> {
        self.inner.rollback_after(stream_id, block).await
    }
}

/// Non-persistent sink without fork support.
#[derive(Default)]
struct Collect {
    data: Mutex<Vec<u64>>,
}

#[async_trait]
impl Sink<Vec<u64>> for Collect {
    async fn write(&self, mut batches: BatchStream<Vec<u64>>) -> Result<(), PipeError> {
        while let Some(batch) = batches.next().await {
            self.data.lock().unwrap().extend(batch?.data);
        }
        Ok(())
    }
}

/// Cancels the stream once `after` batches have been pulled.
struct CancelAfter {
    inner: Arc<dyn Sink<Vec<u64>>>,
    handle: CancelHandle,
    after: usize,
}

#[async_trait]
impl Sink<Vec<u64>> for CancelAfter {
    async fn load_state(&self, stream_id: &str) -> Result<Option<PipelineState>, PipeError> {
        self.inner.load_state(stream_id).await
    }

    fn is_persistent(&self) -> bool {
        self.inner.is_persistent()
    }

    async fn write(&self, batches: BatchStream<Vec<u64>>) -> Result<(), PipeError> {
        let handle = self.handle.clone();
        let after = self.after;
        let mut seen = 0;
        let counted = batches
            .inspect(move |item| {
                if item.is_ok() {
                    seen += 1;
                    if seen == after {
                        handle.cancel();
                    }
                }
            })
            .boxed();
        self.inner.write(counted).await
    }

    async fn fork(
        &self,
        stream_id: &str,
        local: &PipelineState,
        previous_blocks: &[BlockCursor],
    ) -> Result<Option<BlockCursor>, PipeError> {
        self.inner.fork(stream_id, local, previous_blocks).await
    }
}

fn builder(portal: &Arc<MockPortal>) -> StreamBuilder {
    StreamBuilder::new()
        .portal(portal.clone())
        .poll_interval_ms(10)
        .progress_interval_ms(50)
        .retry(RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn bounded_run_delivers_every_block_in_order() {
    let portal = Arc::new(MockPortal::new(100));
    let store = Arc::new(MemoryStateStore::new());
    let sink = checkpointed(&store);
    let progress = Arc::new(Mutex::new(Vec::<Progress>::new()));
    let seen = progress.clone();

    let engine = builder(&portal)
        .id("bounded")
        .request("logs", Range::new(10, 49), json!({"address": ["0x1"]}))
        .on_progress(move |p| seen.lock().unwrap().push(p.clone()))
        .build(Numbers::default())
        .unwrap();
    let profiler = engine.profiler().clone();
    engine.run(sink.clone()).await.unwrap();

    assert_eq!(written(&sink), (10..=49).collect::<Vec<_>>());
    assert_eq!(sink.writer().ranges().len(), 4);

    let state = store.load("bounded").await.unwrap().unwrap().state;
    assert_eq!(state.cursor.number, 49);
    assert_eq!(state.cursor.hash, portal.hash_of(49));

    let last = progress.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.current, 49);
    assert_eq!(last.percent, Some(100.0));

    assert_eq!(profiler.get("numbers").map(|t| t.calls), Some(4));
}

#[tokio::test]
async fn resumed_stream_skips_committed_blocks() {
    let portal = Arc::new(MockPortal::new(100));
    let store = Arc::new(MemoryStateStore::new());

    let first = checkpointed(&store);
    builder(&portal)
        .id("resume")
        .request("logs", Range::new(0, 29), json!({}))
        .build(Numbers::default())
        .unwrap()
        .run(first.clone())
        .await
        .unwrap();
    assert_eq!(written(&first), (0..=29).collect::<Vec<_>>());

    let second = checkpointed(&store);
    builder(&portal)
        .id("resume")
        .request("logs", Range::new(0, 59), json!({}))
        .build(Numbers::default())
        .unwrap()
        .run(second.clone())
        .await
        .unwrap();
    assert_eq!(written(&second), (30..=59).collect::<Vec<_>>());
}

#[tokio::test]
async fn cancellation_keeps_only_fully_committed_batches() {
    let portal = Arc::new(MockPortal::new(60));
    let store = Arc::new(MemoryStateStore::new());
    let handle = CancelHandle::new();

    let first = checkpointed(&store);
    let cancelling = Arc::new(CancelAfter {
        inner: first.clone(),
        handle: handle.clone(),
        after: 2,
    });
    builder(&portal)
        .id("cancel")
        .request("logs", Range::new(0, 59), json!({}))
        .cancel_on(handle.signal())
        .build(Numbers::default())
        .unwrap()
        .run(cancelling)
        .await
        .unwrap();
    assert_eq!(written(&first), (0..=19).collect::<Vec<_>>());
    assert_eq!(store.load("cancel").await.unwrap().unwrap().state.cursor.number, 19);

    let second = checkpointed(&store);
    builder(&portal)
        .id("cancel")
        .request("logs", Range::new(0, 59), json!({}))
        .build(Numbers::default())
        .unwrap()
        .run(second.clone())
        .await
        .unwrap();

    let mut all = written(&first);
    all.extend(written(&second));
    assert_eq!(all, (0..=59).collect::<Vec<_>>());
}

#[tokio::test]
async fn fork_rolls_back_to_common_ancestor() {
    let portal = Arc::new(MockPortal::new(40).reorg_after(2, 15));
    let store = Arc::new(MemoryStateStore::new());
    let sink = checkpointed(&store);
    let numbers = Numbers::default();

    builder(&portal)
        .id("forky")
        .request("logs", Range::new(0, 39), json!({}))
        .build(numbers.clone())
        .unwrap()
        .run(sink.clone())
        .await
        .unwrap();

    assert_eq!(written(&sink), (0..=39).collect::<Vec<_>>());
    assert_eq!(
        sink.writer().ranges().iter().map(|r| (r.from, r.to)).collect::<Vec<_>>(),
        vec![(0, Some(9)), (10, Some(14)), (15, Some(24)), (25, Some(34)), (35, Some(39))]
    );
    assert!(numbers.events().contains(&"fork@14".to_string()));

    let state = store.load("forky").await.unwrap().unwrap().state;
    assert_eq!(state.cursor.hash, block_hash(39, 1));
    let chain_hashes: Vec<_> = state.rollback_chain.iter().filter(|b| b.number == 15).collect();
    assert_eq!(chain_hashes, vec![&BlockCursor::new(15, block_hash(15, 1))]);
}

#[tokio::test]
async fn fork_without_sink_support_is_a_configuration_error() {
    let portal = Arc::new(MockPortal::new(30).reorg_after(1, 5));
    let sink = Arc::new(Collect::default());

    let err = builder(&portal)
        .id("no-fork")
        .request("logs", Range::new(0, 29), json!({}))
        .build(Numbers::default())
        .unwrap()
        .run(sink.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, PipeError::ForkUnsupported));
    assert!(err.is_config());
    assert_eq!(*sink.data.lock().unwrap(), (0..=9).collect::<Vec<_>>());
}

#[tokio::test]
async fn default_id_with_persistent_sink_fails_before_fetching() {
    let portal = Arc::new(MockPortal::new(10));
    let store = Arc::new(MemoryStateStore::new());

    let err = builder(&portal)
        .request("logs", Range::new(0, 9), json!({}))
        .build(Numbers::default())
        .unwrap()
        .run(checkpointed(&store))
        .await
        .unwrap_err();

    assert!(matches!(err, PipeError::Config(_)));
    assert_eq!(portal.fetches(), 0);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let portal = Arc::new(MockPortal::new(20).fail_first(2));
    let sink = Arc::new(Collect::default());

    builder(&portal)
        .request("logs", Range::new(0, 19), json!({}))
        .build(Numbers::default())
        .unwrap()
        .run(sink.clone())
        .await
        .unwrap();
    assert_eq!(*sink.data.lock().unwrap(), (0..=19).collect::<Vec<_>>());
}

#[tokio::test]
async fn retry_exhaustion_is_fatal_and_stops_stages() {
    let portal = Arc::new(MockPortal::new(20).fail_first(100));
    let numbers = Numbers::default();

    let err = builder(&portal)
        .request("logs", Range::new(0, 19), json!({}))
        .build(numbers.clone())
        .unwrap()
        .run(Arc::new(Collect::default()))
        .await
        .unwrap_err();

    assert!(matches!(err, PipeError::FetchExhausted { attempts: 4, .. }));
    assert_eq!(numbers.events(), vec!["start", "stop"]);
}

#[tokio::test]
async fn finalized_batches_replay_from_cache() {
    let portal = Arc::new(MockPortal::new(30).finalized_lag(0));
    let cache = Arc::new(MemoryCache::new());

    let first = checkpointed(&Arc::new(MemoryStateStore::new()));
    builder(&portal)
        .id("cache-a")
        .cache(cache.clone())
        .request("logs", Range::new(0, 29), json!({}))
        .build(Numbers::default())
        .unwrap()
        .run(first.clone())
        .await
        .unwrap();
    assert_eq!(cache.len(), 3);
    let fetches = portal.fetches();

    let second = checkpointed(&Arc::new(MemoryStateStore::new()));
    builder(&portal)
        .id("cache-b")
        .cache(cache.clone())
        .request("logs", Range::new(0, 29), json!({}))
        .build(Numbers::default())
        .unwrap()
        .run(second.clone())
        .await
        .unwrap();

    assert_eq!(portal.fetches(), fetches);
    assert_eq!(written(&second), written(&first));
}

#[tokio::test]
async fn unfinalized_batches_are_not_cached() {
    let portal = Arc::new(MockPortal::new(30));
    let cache = Arc::new(MemoryCache::new());

    builder(&portal)
        .cache(cache.clone())
        .request("logs", Range::new(0, 29), json!({}))
        .build(Numbers::default())
        .unwrap()
        .run(Arc::new(Collect::default()))
        .await
        .unwrap();
    assert!(cache.is_empty());
}

#[tokio::test]
async fn latest_follows_the_head_until_cancelled() {
    let portal = Arc::new(MockPortal::new(101));
    let handle = CancelHandle::new();
    let collect = Arc::new(Collect::default());
    let sink = Arc::new(CancelAfter {
        inner: collect.clone(),
        handle: handle.clone(),
        after: 1,
    });

    builder(&portal)
        .request("logs", Range::latest(), json!({}))
        .cancel_on(handle.signal())
        .build(Numbers::default())
        .unwrap()
        .run(sink)
        .await
        .unwrap();
    assert_eq!(*collect.data.lock().unwrap(), vec![100]);
}

#[tokio::test]
async fn timestamp_bounds_resolve_through_the_portal() {
    let portal = Arc::new(MockPortal::new(50));
    let sink = Arc::new(Collect::default());
    let at = |secs| RangeBound::Timestamp(DateTime::<Utc>::from_timestamp(secs, 0).unwrap());

    builder(&portal)
        .request(
            "logs",
            Range {
                from: at(100),
                to: Some(at(190)),
            },
            json!({}),
        )
        .build(Numbers::default())
        .unwrap()
        .run(sink.clone())
        .await
        .unwrap();
    assert_eq!(*sink.data.lock().unwrap(), (10..=19).collect::<Vec<_>>());
}

#[tokio::test]
async fn schema_mismatch_is_fatal() {
    let portal = Arc::new(MockPortal::new(10).with_extra_header_field());
    let numbers = Numbers::default();

    let err = builder(&portal)
        .request("logs", Range::new(0, 9), json!({}))
        .build(numbers.clone())
        .unwrap()
        .run(Arc::new(Collect::default()))
        .await
        .unwrap_err();

    assert!(matches!(err, PipeError::Normalize(_)));
    assert!(err.to_string().contains("miner"));
    assert_eq!(numbers.events(), vec!["start", "stop"]);
}

#[tokio::test]
async fn fork_below_finalized_block_is_fatal() {
    let portal = Arc::new(MockPortal::new(40).finalized_lag(0).reorg_after(2, 5));
    let store = Arc::new(MemoryStateStore::new());
    let sink = checkpointed(&store);
    let numbers = Numbers::default();

    let err = builder(&portal)
        .id("deep-fork")
        .request("logs", Range::new(0, 39), json!({}))
        .build(numbers.clone())
        .unwrap()
        .run(sink.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, PipeError::UnresolvedFork { from_block: 20, .. }));
    assert!(err.is_fatal());
    assert_eq!(written(&sink), (0..=19).collect::<Vec<_>>());
    assert_eq!(store.load("deep-fork").await.unwrap().unwrap().state.cursor.number, 19);
    assert_eq!(numbers.events(), vec!["start", "stop"]);
}

#[tokio::test]
async fn transform_error_aborts_batch_without_committing() {
    let portal = Arc::new(MockPortal::new(40));
    let store = Arc::new(MemoryStateStore::new());
    let sink = checkpointed(&store);
    let numbers = Numbers::failing_from(20);

    let err = builder(&portal)
        .id("bad-stage")
        .request("logs", Range::new(0, 39), json!({}))
        .build(numbers.clone())
        .unwrap()
        .run(sink.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, PipeError::Transform(TransformError::Stage { .. })));
    assert_eq!(written(&sink), (0..=19).collect::<Vec<_>>());
    assert_eq!(store.load("bad-stage").await.unwrap().unwrap().state.cursor.number, 19);
    assert_eq!(store.history("bad-stage", 10).await.unwrap().len(), 2);
    assert_eq!(numbers.events(), vec!["start", "stop"]);
}

#[tokio::test]
async fn writer_error_propagates_and_state_stays_put() {
    let portal = Arc::new(MockPortal::new(40));
    let store = Arc::new(MemoryStateStore::new());
    let writer = FailingWriter {
        inner: MemoryWriter::new(),
        fail_from: 20,
    };
    let sink: Arc<CheckpointedSink<FailingWriter, Vec<u64>>> =
        Arc::new(CheckpointedSink::new(writer, store.clone()));
    let numbers = Numbers::default();

    let err = builder(&portal)
        .id("bad-writer")
        .request("logs", Range::new(0, 39), json!({}))
        .build(numbers.clone())
        .unwrap()
        .run(sink.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, PipeError::Sink(ref reason) if reason == "disk full"));
    assert_eq!(sink.writer().inner.data().concat(), (0..=19).collect::<Vec<_>>());
    assert_eq!(store.load("bad-writer").await.unwrap().unwrap().state.cursor.number, 19);
    assert_eq!(numbers.events(), vec!["start", "stop"]);
}

#[tokio::test]
async fn panicking_progress_hook_does_not_fail_the_stream() {
    let portal = Arc::new(MockPortal::new(20));
    let sink = Arc::new(Collect::default());

    builder(&portal)
        .request("logs", Range::new(0, 19), json!({}))
        .on_progress(|_| panic!("progress hook blew up"))
        .build(Numbers::default())
        .unwrap()
        .run(sink.clone())
        .await
        .unwrap();
    assert_eq!(*sink.data.lock().unwrap(), (0..=19).collect::<Vec<_>>());
}
