//! Engine-level error type

use thiserror::Error;

use troupe_core::WorkflowId;

use crate::storage::StorageError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the engine to submitters and operators
#[derive(Debug, Error)]
pub enum EngineError {
    /// Graph construction or compilation failed
    #[error(transparent)]
    Graph(#[from] troupe_graph::GraphError),

    /// Lane admission or operation failed
    #[error(transparent)]
    Lane(#[from] troupe_lanes::LaneError),

    /// Signal bus or pattern failure
    #[error(transparent)]
    Signal(#[from] troupe_signals::SignalError),

    /// Cluster coordination failure
    #[error(transparent)]
    Coordination(#[from] troupe_cluster::CoordinationError),

    /// Storage backend failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No workflow with the given identifier
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    /// A task names an agent kind with no registered handler
    #[error("no agent registered for kind {0}")]
    UnknownAgent(String),

    /// Invalid engine or node configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The engine is shutting down
    #[error("engine is shutting down")]
    Shutdown,
}
