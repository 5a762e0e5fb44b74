use thiserror::Error;

use crate::source::SourceError;

#[derive(Error, Debug)]
pub enum LimiterError {
    /// Spend or refund was called with a cost of zero or less.
    #[error("invalid cost, must be > 0")]
    InvalidCost,

    /// Check was called with a negative cost.
    #[error("invalid check cost, must be >= 0")]
    InvalidCheckCost,

    /// The cost exceeds the burst capacity of the resolved limit.
    #[error("invalid cost, must be <= the limit burst")]
    CostOverLimit,

    /// A batch operation was called with zero buckets.
    #[error("invalid batch, a batch must have >= 1 bucket")]
    EmptyBatch,

    #[error("unrecognized limit name: {0}")]
    InvalidLimitName(String),

    #[error("invalid bucket identity: {0}")]
    InvalidBucketKey(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("file system error: {0}")]
    FileSystemError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A non-NotFound failure from the underlying source, propagated
    /// verbatim so callers can decide whether to fail open or closed.
    #[error("source error: {0}")]
    Source(#[from] SourceError),
}

/// Result type alias for rate limiter operations
pub type Result<T> = std::result::Result<T, LimiterError>;
