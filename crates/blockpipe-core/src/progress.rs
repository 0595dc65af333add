//! Progress reporting side channel.
//!
//! The engine updates a [`ProgressTracker`] after every committed batch. A
//! detached reporter task reads the latest snapshot on a timer and hands it
//! to a hook. The reporter never blocks or fails the main loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Callback invoked with each progress snapshot.
pub type ProgressHook = Arc<dyn Fn(&Progress) + Send + Sync>;

/// One progress snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub stream_id: String,
    /// First block of the run.
    pub from: u64,
    /// Last committed block.
    pub current: u64,
    /// Target block, `None` while following the head.
    pub to: Option<u64>,
    /// Completion in `[0, 100]`, `None` without a target.
    pub percent: Option<f64>,
    /// Blocks per second since the last reset.
    pub speed: f64,
}

/// Logs progress at `info`.
pub fn log_progress(p: &Progress) {
    tracing::info!(
        stream = %p.stream_id,
        from = p.from,
        current = p.current,
        to = ?p.to,
        percent = ?p.percent.map(|v| (v * 100.0).round() / 100.0),
        blocks_per_sec = (p.speed * 10.0).round() / 10.0,
        "Progress"
    );
}

/// Computes progress snapshots and publishes them on a watch channel.
#[derive(Debug)]
pub struct ProgressTracker {
    stream_id: String,
    from: u64,
    to: Option<u64>,
    started: Instant,
    processed: u64,
    tx: watch::Sender<Option<Progress>>,
}

impl ProgressTracker {
    pub fn new(stream_id: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            stream_id: stream_id.into(),
            from: 0,
            to: None,
            started: Instant::now(),
            processed: 0,
            tx,
        }
    }

    /// Receiver for the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Option<Progress>> {
        self.tx.subscribe()
    }

    /// Restart measurement at `from`, e.g. after a fork.
    pub fn reset(&mut self, from: u64, to: Option<u64>) {
        self.from = from;
        self.to = to;
        self.started = Instant::now();
        self.processed = 0;
    }

    pub fn set_target(&mut self, to: Option<u64>) {
        self.to = to;
    }

    /// Record a committed batch ending at `current` that contained `blocks` blocks.
    pub fn update(&mut self, current: u64, blocks: u64) -> Progress {
        self.processed += blocks;
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            self.processed as f64 / elapsed
        } else {
            0.0
        };
        let percent = self.to.map(|to| {
            if to <= self.from {
                100.0
            } else {
                let done = current.saturating_sub(self.from) as f64 + 1.0;
                (done / (to - self.from + 1) as f64 * 100.0).min(100.0)
            }
        });
        let progress = Progress {
            stream_id: self.stream_id.clone(),
            from: self.from,
            current,
            to: self.to,
            percent,
            speed,
        };
        self.tx.send_replace(Some(progress.clone()));
        progress
    }
}

/// Spawn a task calling `hook` with the latest snapshot every `interval`.
///
/// The task ends when the tracker is dropped.
pub fn spawn_reporter(
    mut rx: watch::Receiver<Option<Progress>>,
    interval: Duration,
    hook: ProgressHook,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let snapshot = rx.borrow_and_update().clone();
                    if let Some(progress) = snapshot {
                        hook(&progress);
                    }
                }
            }
        }
        let last = rx.borrow().clone();
        if let Some(progress) = last {
            hook(&progress);
        }
    })
}
