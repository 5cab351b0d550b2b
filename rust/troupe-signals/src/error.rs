//! Error types for the signal subsystem

use std::collections::BTreeMap;

use thiserror::Error;

/// Result type for signal operations
pub type SignalResult<T> = Result<T, SignalError>;

/// Errors surfaced by buses, the router, and the message patterns
#[derive(Debug, Error)]
pub enum SignalError {
    /// The bus has been closed
    #[error("signal bus is closed")]
    Closed,

    /// A subscription already exists for the task
    #[error("duplicate subscription for task {0}")]
    DuplicateSubscription(String),

    /// Unknown signal kind on the wire
    #[error("invalid signal type: {0}")]
    InvalidSignalType(String),

    /// Empty or malformed target task identifier
    #[error("invalid task id")]
    InvalidTaskId,

    /// Payload encoding or decoding failed
    #[error("signal codec error: {0}")]
    Codec(String),

    /// The pub/sub substrate failed
    #[error("signal substrate error: {0}")]
    Substrate(String),

    /// Cross-node routing failed
    #[error("signal routing error: {0}")]
    Routing(String),

    /// Every collected task reported an error
    #[error("all {} collected tasks failed", errors.len())]
    AggregateFailure {
        /// Per-task error strings
        errors: BTreeMap<String, String>,
    },

    /// The collector's deadline fired before all results arrived
    #[error("collect timed out with {} of {expected} results", partial.len())]
    CollectTimeout {
        /// Results received before the deadline
        partial: BTreeMap<String, Result<serde_json::Value, String>>,
        /// Number of targets being collected
        expected: usize,
    },
}

impl From<serde_json::Error> for SignalError {
    fn from(err: serde_json::Error) -> Self {
        SignalError::Codec(err.to_string())
    }
}

impl From<redis::RedisError> for SignalError {
    fn from(err: redis::RedisError) -> Self {
        SignalError::Substrate(err.to_string())
    }
}
