//! The `Transformer` trait — one processing stage of a pipeline.
//!
//! Stages declare what they need through the `query` hook, receive lifecycle
//! calls (`start`, `stop`, `fork`) and turn an input into an output in
//! `transform`. Sequential composition is [`Pipe`]; fan-out lives in
//! [`Composite`](crate::composite::Composite).

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;

use crate::cursor::BlockCursor;
use crate::error::TransformError;
use crate::profiler::Profiler;
use crate::query::QueryBuilder;

// ─── StageContext ────────────────────────────────────────────────────────────

/// Explicit per-call context handed to every stage.
///
/// Carries the stream identity, the stage path used for logs and profiling,
/// and a tracing span scoped to the stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub stream_id: Arc<str>,
    /// Slash-separated stage ids from the pipeline root (`"decode/erc20"`).
    pub path: String,
    pub span: tracing::Span,
    pub profiler: Profiler,
}

impl StageContext {
    /// Root context of a stream.
    pub fn new(stream_id: impl Into<Arc<str>>, profiler: Profiler) -> Self {
        let stream_id: Arc<str> = stream_id.into();
        let span = tracing::info_span!("stream", id = %stream_id);
        Self {
            stream_id,
            path: String::new(),
            span,
            profiler,
        }
    }

    /// Context for a nested stage.
    pub fn child(&self, id: &str) -> Self {
        let path = if self.path.is_empty() {
            id.to_string()
        } else {
            format!("{}/{}", self.path, id)
        };
        let span = tracing::debug_span!(parent: &self.span, "stage", id = %id);
        Self {
            stream_id: self.stream_id.clone(),
            path,
            span,
            profiler: self.profiler.clone(),
        }
    }
}

// ─── Transformer ─────────────────────────────────────────────────────────────

/// A processing stage with lifecycle hooks.
///
/// Hooks take `&self`; stages that keep state use interior mutability so
/// fan-out siblings can run concurrently. `transform` must depend only on its
/// input and the stage's own state.
#[async_trait]
pub trait Transformer: Send + Sync {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Stable identifier, used for diagnostics and profiling paths.
    fn id(&self) -> &str;

    /// Contribute fields and requests to the stream's query.
    async fn query(&self, _query: &mut QueryBuilder, _ctx: &StageContext) -> Result<(), TransformError> {
        Ok(())
    }

    async fn start(&self, _ctx: &StageContext) -> Result<(), TransformError> {
        Ok(())
    }

    async fn stop(&self, _ctx: &StageContext) -> Result<(), TransformError> {
        Ok(())
    }

    /// The stream rolled back to `cursor`; drop any state above it.
    async fn fork(&self, _cursor: &BlockCursor, _ctx: &StageContext) -> Result<(), TransformError> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn transform(&self, input: Self::Input, ctx: &StageContext) -> Result<Self::Output, TransformError>;
}

/// A type-erased stage.
pub type BoxTransformer<I, O> = Box<dyn Transformer<Input = I, Output = O>>;

#[async_trait]
impl<T: Transformer + ?Sized> Transformer for Box<T> {
    type Input = T::Input;
    type Output = T::Output;

    fn id(&self) -> &str {
        (**self).id()
    }

    async fn query(&self, query: &mut QueryBuilder, ctx: &StageContext) -> Result<(), TransformError> {
        (**self).query(query, ctx).await
    }

    async fn start(&self, ctx: &StageContext) -> Result<(), TransformError> {
        (**self).start(ctx).await
    }

    async fn stop(&self, ctx: &StageContext) -> Result<(), TransformError> {
        (**self).stop(ctx).await
    }

    async fn fork(&self, cursor: &BlockCursor, ctx: &StageContext) -> Result<(), TransformError> {
        (**self).fork(cursor, ctx).await
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    async fn transform(&self, input: Self::Input, ctx: &StageContext) -> Result<Self::Output, TransformError> {
        (**self).transform(input, ctx).await
    }
}

/// Run `stage.transform` under a child context named `id`, recording its duration.
pub(crate) async fn run_transform<T>(
    stage: &T,
    id: &str,
    input: T::Input,
    ctx: &StageContext,
) -> Result<T::Output, TransformError>
where
    T: Transformer + ?Sized,
{
    let child = ctx.child(id);
    let started = Instant::now();
    let result = stage
        .transform(input, &child)
        .instrument(child.span.clone())
        .await;
    ctx.profiler.record(&child.path, started.elapsed());
    result
}

// ─── FnTransformer ───────────────────────────────────────────────────────────

/// A stateless stage built from a closure.
pub struct FnTransformer<F, I, O> {
    id: String,
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<F, I, O> FnTransformer<F, I, O>
where
    F: Fn(I) -> Result<O, TransformError> + Send + Sync,
{
    pub fn new(id: impl Into<String>, f: F) -> Self {
        Self {
            id: id.into(),
            f,
            _marker: PhantomData,
        }
    }
}

/// Shorthand for [`FnTransformer::new`].
pub fn from_fn<F, I, O>(id: impl Into<String>, f: F) -> FnTransformer<F, I, O>
where
    F: Fn(I) -> Result<O, TransformError> + Send + Sync,
{
    FnTransformer::new(id, f)
}

#[async_trait]
impl<F, I, O> Transformer for FnTransformer<F, I, O>
where
    F: Fn(I) -> Result<O, TransformError> + Send + Sync,
    I: Send + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = O;

    fn id(&self) -> &str {
        &self.id
    }

    async fn transform(&self, input: I, _ctx: &StageContext) -> Result<O, TransformError> {
        (self.f)(input)
    }
}

// ─── Pipe ────────────────────────────────────────────────────────────────────

/// Sequential composition: `second` consumes exactly what `first` produces.
///
/// Hooks run `first` then `second`; `stop` runs in reverse.
pub struct Pipe<A, B> {
    id: String,
    first: A,
    second: B,
}

impl<A, B> Pipe<A, B>
where
    A: Transformer,
    B: Transformer<Input = A::Output>,
{
    pub fn new(first: A, second: B) -> Self {
        let id = format!("{}|{}", first.id(), second.id());
        Self { id, first, second }
    }
}

#[async_trait]
impl<A, B> Transformer for Pipe<A, B>
where
    A: Transformer,
    B: Transformer<Input = A::Output>,
{
    type Input = A::Input;
    type Output = B::Output;

    fn id(&self) -> &str {
        &self.id
    }

    async fn query(&self, query: &mut QueryBuilder, ctx: &StageContext) -> Result<(), TransformError> {
        self.first.query(query, &ctx.child(self.first.id())).await?;
        self.second.query(query, &ctx.child(self.second.id())).await
    }

    async fn start(&self, ctx: &StageContext) -> Result<(), TransformError> {
        self.first.start(&ctx.child(self.first.id())).await?;
        self.second.start(&ctx.child(self.second.id())).await
    }

    async fn stop(&self, ctx: &StageContext) -> Result<(), TransformError> {
        let second = self.second.stop(&ctx.child(self.second.id())).await;
        let first = self.first.stop(&ctx.child(self.first.id())).await;
        second.and(first)
    }

    async fn fork(&self, cursor: &BlockCursor, ctx: &StageContext) -> Result<(), TransformError> {
        self.first.fork(cursor, &ctx.child(self.first.id())).await?;
        self.second.fork(cursor, &ctx.child(self.second.id())).await
    }

    fn is_healthy(&self) -> bool {
        self.first.is_healthy() && self.second.is_healthy()
    }

    async fn transform(&self, input: Self::Input, ctx: &StageContext) -> Result<Self::Output, TransformError> {
        let mid = run_transform(&self.first, self.first.id(), input, ctx).await?;
        run_transform(&self.second, self.second.id(), mid, ctx).await
    }
}

// ─── Extension methods ───────────────────────────────────────────────────────

pub trait TransformerExt: Transformer + Sized {
    /// Feed this stage's output into `next`.
    fn pipe<B>(self, next: B) -> Pipe<Self, B>
    where
        B: Transformer<Input = Self::Output>,
    {
        Pipe::new(self, next)
    }

    /// Append a closure stage.
    fn map<F, O>(self, id: impl Into<String>, f: F) -> Pipe<Self, FnTransformer<F, Self::Output, O>>
    where
        F: Fn(Self::Output) -> Result<O, TransformError> + Send + Sync,
        O: Send + 'static,
    {
        Pipe::new(self, FnTransformer::new(id, f))
    }

    fn boxed(self) -> BoxTransformer<Self::Input, Self::Output>
    where
        Self: 'static,
    {
        Box::new(self)
    }
}

impl<T: Transformer> TransformerExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records lifecycle calls into a shared log.
    struct Probe {
        id: String,
        log: Arc<Mutex<Vec<String>>>,
        healthy: bool,
    }

    impl Probe {
        fn new(id: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                id: id.to_string(),
                log: log.clone(),
                healthy: true,
            }
        }

        fn push(&self, event: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", self.id, event));
        }
    }

    #[async_trait]
    impl Transformer for Probe {
        type Input = u64;
        type Output = u64;

        fn id(&self) -> &str {
            &self.id
        }

        async fn start(&self, _ctx: &StageContext) -> Result<(), TransformError> {
            self.push("start");
            Ok(())
        }

        async fn stop(&self, _ctx: &StageContext) -> Result<(), TransformError> {
            self.push("stop");
            Ok(())
        }

        async fn fork(&self, cursor: &BlockCursor, _ctx: &StageContext) -> Result<(), TransformError> {
            self.push(&format!("fork@{}", cursor.number));
            Ok(())
        }

        fn is_healthy(&self) -> bool {
            self.healthy
        }

        async fn transform(&self, input: u64, ctx: &StageContext) -> Result<u64, TransformError> {
            self.push(&format!("transform@{}", ctx.path));
            Ok(input + 1)
        }
    }

    fn ctx() -> StageContext {
        StageContext::new("test", Profiler::new())
    }

    #[tokio::test]
    async fn pipe_equals_function_composition() {
        let double = from_fn("double", |x: u64| Ok(x * 2));
        let show = from_fn("show", |x: u64| Ok(format!("<{x}>")));
        let pipe = double.pipe(show);
        assert_eq!(pipe.id(), "double|show");
        assert_eq!(pipe.transform(21, &ctx()).await.unwrap(), "<42>");
    }

    #[tokio::test]
    async fn pipe_hook_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipe = Probe::new("a", &log).pipe(Probe::new("b", &log));
        let ctx = ctx();

        pipe.start(&ctx).await.unwrap();
        pipe.fork(&BlockCursor::new(7, "0x7"), &ctx).await.unwrap();
        assert_eq!(pipe.transform(1, &ctx).await.unwrap(), 3);
        pipe.stop(&ctx).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "a:start", "b:start", "a:fork@7", "b:fork@7", "a:transform@a", "b:transform@b",
                "b:stop", "a:stop",
            ]
        );
    }

    #[tokio::test]
    async fn transform_is_profiled_per_stage() {
        let ctx = ctx();
        let pipe = from_fn("inc", |x: u64| Ok(x + 1)).map("neg", |x: u64| Ok(-(x as i64)));
        assert_eq!(pipe.transform(4, &ctx).await.unwrap(), -5);

        let timings = ctx.profiler.snapshot();
        assert_eq!(timings.get("inc").map(|t| t.calls), Some(1));
        assert_eq!(timings.get("neg").map(|t| t.calls), Some(1));
    }

    #[tokio::test]
    async fn boxed_stage_delegates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut probe = Probe::new("p", &log);
        probe.healthy = false;
        let boxed: BoxTransformer<u64, u64> = probe.boxed();
        assert_eq!(boxed.id(), "p");
        assert!(!boxed.is_healthy());
        assert_eq!(boxed.transform(9, &ctx()).await.unwrap(), 10);

        let pipe = from_fn("id", |x: u64| Ok(x)).pipe(boxed);
        assert!(!pipe.is_healthy());
    }

    #[tokio::test]
    async fn stage_errors_abort_the_pipe() {
        let fail = from_fn("fail", |_: u64| -> Result<u64, TransformError> {
            Err(TransformError::stage("fail", "boom"))
        });
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipe = fail.pipe(Probe::new("after", &log));
        let err = pipe.transform(1, &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn child_context_paths() {
        let root = ctx();
        let child = root.child("decode").child("erc20");
        assert_eq!(child.path, "decode/erc20");
        assert_eq!(&*child.stream_id, "test");
    }
}
