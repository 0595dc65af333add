//! Stream configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipeError;
use crate::retry::RetryConfig;

/// Stream id used when none is configured. Not valid with a persistent sink.
pub const DEFAULT_STREAM_ID: &str = "default";

/// Configuration for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Unique name of the stream (partitions persisted state and cache keys).
    #[serde(default = "default_id")]
    pub id: String,
    /// Maximum number of recent cursors kept for fork resolution.
    #[serde(default = "default_rollback_depth")]
    pub rollback_depth: usize,
    /// Wait between polls once the stream has caught up with the head (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Progress report interval (milliseconds).
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Retry policy for transient portal failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_id() -> String {
    DEFAULT_STREAM_ID.to_string()
}

fn default_rollback_depth() -> usize {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_progress_interval_ms() -> u64 {
    5_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            rollback_depth: default_rollback_depth(),
            poll_interval_ms: default_poll_interval_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    /// Returns `true` if no explicit stream id was set.
    pub fn has_default_id(&self) -> bool {
        self.id == DEFAULT_STREAM_ID
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), PipeError> {
        if self.id.trim().is_empty() {
            return Err(PipeError::Config("stream id must not be empty".into()));
        }
        if self.rollback_depth == 0 {
            return Err(PipeError::Config("rollback_depth must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(PipeError::Config(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }
}
