pub mod memory;
pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Classified failure of a source operation. Every implementation maps its
/// native errors onto this taxonomy so that metrics and recovery decisions
/// work uniformly across backends.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The bucket key does not exist. Not a failure: callers treat a missing
    /// bucket as full.
    #[error("bucket not found")]
    NotFound,

    /// The per-command deadline elapsed before the store replied.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The operation was abandoned before it was dispatched to the store.
    #[error("canceled: {0}")]
    Canceled(String),

    /// The network path to the store failed or timed out.
    #[error("network timeout: {0}")]
    Timeout(String),

    /// The store itself returned an error.
    #[error("store error: {0}")]
    Server(String),

    #[error("store failure: {0}")]
    Unknown(String),
}

impl SourceError {
    /// Value of the `result` metric label for this error.
    pub fn result_label(&self) -> &'static str {
        match self {
            SourceError::NotFound => "notFound",
            SourceError::DeadlineExceeded(_) => "deadlineExceeded",
            SourceError::Canceled(_) => "canceled",
            SourceError::Timeout(_) => "timeout",
            SourceError::Server(_) => "redisError",
            SourceError::Unknown(_) => "failed",
        }
    }
}

/// Persistent bucket state: TATs keyed by bucket key, stored as nanosecond
/// UNIX timestamps. Implementations must be safe for concurrent use; no
/// ordering is promised between concurrent operations on the same key.
#[async_trait]
pub trait Source: Send + Sync {
    /// Retrieve the TAT stored at `bucket_key`, or `NotFound`.
    async fn get(&self, bucket_key: &str) -> Result<i64, SourceError>;

    /// Unconditionally overwrite the TAT at `bucket_key`.
    async fn set(&self, bucket_key: &str, tat: i64) -> Result<(), SourceError>;

    /// Retrieve the TATs at `bucket_keys`. Missing keys are silently
    /// omitted from the returned map.
    async fn batch_get(&self, bucket_keys: &[String]) -> Result<HashMap<String, i64>, SourceError>;

    /// Store each TAT at its bucket key. The batch is pipelined, not
    /// transactional: each individual write is atomic, the batch is not.
    async fn batch_set(&self, tats: &HashMap<String, i64>) -> Result<(), SourceError>;

    /// Remove the TAT at `bucket_key`. Succeeds whether or not the key
    /// existed.
    async fn delete(&self, bucket_key: &str) -> Result<(), SourceError>;

    /// Probe the liveness of every shard backing this source.
    async fn ping(&self) -> Result<(), SourceError>;
}
