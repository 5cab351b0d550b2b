//! Error types for cluster coordination

use thiserror::Error;

use troupe_core::ShardKey;

/// Result type for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors surfaced by the coordinator and its clients
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// No membership record for the node
    #[error("node {0} not found")]
    NodeNotFound(String),

    /// The supplied lease does not match the stored one
    #[error("lease mismatch for node {0}")]
    LeaseMismatch(String),

    /// The lease expired before the operation
    #[error("lease expired for node {0}")]
    LeaseExpired(String),

    /// Another node holds a live leader lease
    #[error("leader lease held by {holder}")]
    LeaderLeaseHeld {
        /// Current holder
        holder: String,
    },

    /// Another node owns the shard within its claim TTL
    #[error("shard {shard} owned by {owner}")]
    OwnershipConflict {
        /// Contested shard
        shard: ShardKey,
        /// Current owner
        owner: String,
    },

    /// The fencing token is not the current one for the shard
    #[error("invalid fencing token {token} for shard {shard}")]
    InvalidFencingToken {
        /// Shard key
        shard: ShardKey,
        /// Rejected token
        token: u64,
    },

    /// Coordinator backend failure
    #[error("coordination backend error: {0}")]
    Backend(String),
}
