//! Fan-out / fan-in composition.
//!
//! Every sibling receives a clone of the same input. Hooks and transforms run
//! concurrently and the composite waits for all of them before returning.
//! Output is keyed by the name each sibling was registered under.

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};

use crate::cursor::BlockCursor;
use crate::error::TransformError;
use crate::query::QueryBuilder;
use crate::transformer::{run_transform, BoxTransformer, StageContext, Transformer};

struct Entry<I, O> {
    key: String,
    /// Sibling id, prefixed with `key` when it collides with another sibling.
    id: String,
    stage: BoxTransformer<I, O>,
}

/// Keyed siblings sharing one input.
pub struct Composite<I, O> {
    id: String,
    entries: Vec<Entry<I, O>>,
}

impl<I, O> Composite<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: Vec::new(),
        }
    }

    /// Register `stage` under `key`. A stage already registered under the
    /// same key is replaced.
    pub fn extend<T>(mut self, key: impl Into<String>, stage: T) -> Self
    where
        T: Transformer<Input = I, Output = O> + 'static,
    {
        let key = key.into();
        let entry = Entry {
            id: stage.id().to_string(),
            key: key.clone(),
            stage: Box::new(stage),
        };
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(slot) => *slot = entry,
            None => self.entries.push(entry),
        }
        self.assign_ids();
        self
    }

    /// Effective sibling ids in registration order, as `(key, id)`.
    pub fn sibling_ids(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|e| (e.key.as_str(), e.id.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn assign_ids(&mut self) {
        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        for entry in &self.entries {
            *seen.entry(entry.stage.id()).or_default() += 1;
        }
        let colliding: Vec<bool> = self
            .entries
            .iter()
            .map(|e| seen.get(e.stage.id()).copied().unwrap_or(0) > 1)
            .collect();
        for (entry, collides) in self.entries.iter_mut().zip(colliding) {
            entry.id = if collides {
                format!("{}.{}", entry.key, entry.stage.id())
            } else {
                entry.stage.id().to_string()
            };
        }
    }
}

#[async_trait]
impl<I, O> Transformer for Composite<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = BTreeMap<String, O>;

    fn id(&self) -> &str {
        &self.id
    }

    /// Each sibling fills its own scratch builder; results are merged in
    /// registration order.
    async fn query(&self, query: &mut QueryBuilder, ctx: &StageContext) -> Result<(), TransformError> {
        let scratch = try_join_all(self.entries.iter().map(|e| async move {
            let mut local = QueryBuilder::new();
            e.stage.query(&mut local, &ctx.child(&e.id)).await?;
            Ok::<_, TransformError>(local)
        }))
        .await?;
        for local in scratch {
            query.merge(local);
        }
        Ok(())
    }

    async fn start(&self, ctx: &StageContext) -> Result<(), TransformError> {
        join_siblings(self.entries.iter().map(|e| async move { e.stage.start(&ctx.child(&e.id)).await })).await
    }

    async fn stop(&self, ctx: &StageContext) -> Result<(), TransformError> {
        join_siblings(self.entries.iter().map(|e| async move { e.stage.stop(&ctx.child(&e.id)).await })).await
    }

    async fn fork(&self, cursor: &BlockCursor, ctx: &StageContext) -> Result<(), TransformError> {
        join_siblings(
            self.entries
                .iter()
                .map(|e| async move { e.stage.fork(cursor, &ctx.child(&e.id)).await }),
        )
        .await
    }

    fn is_healthy(&self) -> bool {
        self.entries.iter().all(|e| e.stage.is_healthy())
    }

    /// Any sibling failure fails the whole batch; partial results are dropped.
    async fn transform(&self, input: I, ctx: &StageContext) -> Result<Self::Output, TransformError> {
        let outputs = try_join_all(self.entries.iter().map(|e| {
            let input = input.clone();
            async move {
                let out = run_transform(&e.stage, &e.id, input, ctx).await?;
                Ok::<_, TransformError>((e.key.clone(), out))
            }
        }))
        .await?;
        Ok(outputs.into_iter().collect())
    }
}

/// Runs every lifecycle hook to completion, then reports the first failure
/// in registration order.
async fn join_siblings<F>(hooks: impl IntoIterator<Item = F>) -> Result<(), TransformError>
where
    F: Future<Output = Result<(), TransformError>>,
{
    join_all(hooks).await.into_iter().collect()
}
