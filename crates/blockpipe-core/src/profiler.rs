//! Per-stage call counters and durations.
//!
//! Every transformer call is recorded under its stage path
//! (`"decode/erc20"`), so a slow sibling in a fan-out shows up by name.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

/// Aggregated timings of one stage path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTiming {
    pub calls: u64,
    pub total: Duration,
    pub max: Duration,
}

impl StageTiming {
    /// Mean duration per call.
    pub fn mean(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total.as_nanos() / u128::from(self.calls);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }
}

/// Shared, cloneable timing registry for one stream.
#[derive(Debug, Clone, Default)]
pub struct Profiler {
    timings: Arc<Mutex<BTreeMap<String, StageTiming>>>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call of `path` that took `elapsed`.
    pub fn record(&self, path: &str, elapsed: Duration) {
        let mut timings = self.timings.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = timings.entry(path.to_string()).or_default();
        entry.calls += 1;
        entry.total += elapsed;
        entry.max = entry.max.max(elapsed);
    }

    /// Copy of all timings recorded so far, keyed by stage path.
    pub fn snapshot(&self) -> BTreeMap<String, StageTiming> {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, path: &str) -> Option<StageTiming> {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .copied()
    }

    pub fn reset(&self) {
        self.timings.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
