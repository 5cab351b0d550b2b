//! Error types for lane admission and operation

use thiserror::Error;

/// Result type for lane operations
pub type LaneResult<T> = Result<T, LaneError>;

/// Errors surfaced by lanes and the lane manager
#[derive(Debug, Error)]
pub enum LaneError {
    /// Lane has been closed
    #[error("lane {0} is closed")]
    Closed(String),

    /// Admission rejected at the capacity bound
    #[error("lane {lane} at capacity ({capacity})")]
    CapacityExceeded {
        /// Rejecting lane
        lane: String,
        /// Configured bound
        capacity: usize,
    },

    /// No lane registered under the requested name
    #[error("lane {0} not found")]
    NotFound(String),

    /// The submitter's context was cancelled while waiting
    #[error("submission cancelled while waiting for lane {0}")]
    Cancelled(String),

    /// Invalid lane configuration
    #[error("lane configuration error: {0}")]
    Config(String),

    /// The backing substrate (Redis) failed
    #[error("lane substrate error: {0}")]
    Substrate(String),
}

impl From<redis::RedisError> for LaneError {
    fn from(err: redis::RedisError) -> Self {
        LaneError::Substrate(err.to_string())
    }
}
