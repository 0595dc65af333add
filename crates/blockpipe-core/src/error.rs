//! Error types for the blockpipe pipeline.

use thiserror::Error;

use crate::portal::ForkInfo;

/// Accepted textual forms of a range bound, shown in every parse error.
pub const ACCEPTED_BOUND_FORMATS: &str =
    "a block number (1000000, 1_000_000, 1,000,000), a relative offset (+1000), \
     \"latest\" (start only) or an ISO date (2024-01-31, 2024-01-31T12:00:00Z)";

/// A malformed range expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid range bound '{value}': expected {}", ACCEPTED_BOUND_FORMATS)]
    InvalidBound { value: String },

    #[error("'latest' is only valid as a range start, got it as '{field}'")]
    LatestNotAllowed { field: &'static str },

    #[error("relative bound '{value}' needs a numeric anchor")]
    MissingAnchor { value: String },

    #[error("block number overflow in '{value}'")]
    Overflow { value: String },
}

/// Failure to turn accumulated requests into an executable plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("range starts at 'latest' but no portal head is available")]
    MissingHead,

    #[error("range bound {bound} is a timestamp; resolve timestamps before planning")]
    UnresolvedTimestamp { bound: String },
}

/// The raw batch does not match the requested field selection.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("line {line}: invalid JSON: {source}")]
    InvalidJson {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: block is not a JSON object with a 'header'")]
    MissingHeader { line: usize },

    #[error("block {block}: required field '{group}.{field}' is missing")]
    MissingField {
        block: String,
        group: String,
        field: String,
    },

    #[error("block {block}: field '{group}.{field}' has the wrong type, expected {expected}")]
    InvalidType {
        block: String,
        group: String,
        field: String,
        expected: &'static str,
    },

    #[error("block {block}: group '{group}' was not requested")]
    UnexpectedGroup { block: String, group: String },

    #[error("block {block}: field '{group}.{field}' was not requested")]
    UnexpectedField {
        block: String,
        group: String,
        field: String,
    },
}

/// Failure inside a transformer stage.
#[derive(Debug, Clone, Error)]
pub enum TransformError {
    #[error("stage '{stage}' failed: {reason}")]
    Stage { stage: String, reason: String },

    #[error("stage '{stage}' is unhealthy")]
    Unhealthy { stage: String },
}

impl TransformError {
    /// Create a stage error with context.
    pub fn stage(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}

/// Errors reported by a [`Portal`](crate::portal::Portal).
#[derive(Debug, Clone, Error)]
pub enum PortalError {
    /// The expected parent hash is no longer canonical.
    #[error(
        "fork at block {}: parent hash {:?} is not canonical",
        .0.from_block,
        .0.parent_block_hash
    )]
    Fork(ForkInfo),

    /// Network failure, timeout, throttling. Safe to retry.
    #[error("transient portal error: {0}")]
    Transient(String),

    /// The portal does not support the operation.
    #[error("portal does not support {0}")]
    Unsupported(&'static str),

    #[error("portal error: {0}")]
    Other(String),
}

impl PortalError {
    /// Returns `true` if the request can be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors surfaced by the streaming engine and its collaborators.
#[derive(Debug, Error)]
pub enum PipeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("sink does not implement fork handling; refusing to continue after a chain fork")]
    ForkUnsupported,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Portal(#[from] PortalError),

    #[error("portal request failed after {attempts} attempts: {last}")]
    FetchExhausted { attempts: u32, last: PortalError },

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(
        "unresolvable fork at block {from_block} (parent {parent_hash:?}): \
         no common ancestor above the finalized block"
    )]
    UnresolvedFork {
        from_block: u64,
        parent_hash: Option<String>,
    },

    #[error("sink error: {0}")]
    Sink(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cache error: {0}")]
    Cache(String),
}

impl PipeError {
    /// Returns `true` for configuration problems detected before or while starting.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::ForkUnsupported)
    }

    /// Returns `true` if the stream cannot continue past this error.
    ///
    /// Transient portal errors and fork signals are handled inside the engine;
    /// everything else ends the stream.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Portal(e) => !e.is_retryable() && !matches!(e, PortalError::Fork(_)),
            _ => true,
        }
    }

    /// Returns `true` if the error is a portal fork signal that the engine handles itself.
    pub fn is_fork(&self) -> bool {
        matches!(self, Self::Portal(PortalError::Fork(_)))
    }
}
