//! Error types for graph construction and compilation

use thiserror::Error;

/// Result type for graph operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors surfaced while building or compiling a task graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Task failed structural validation
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// A task with the same identifier already exists
    #[error("duplicate task id: {0}")]
    DuplicateTask(String),

    /// A task lists itself as a dependency
    #[error("task {0} depends on itself")]
    SelfDependency(String),

    /// A dependency references a task that does not exist
    #[error("task {task} depends on missing task {dependency}")]
    MissingDependency {
        /// Dependent task
        task: String,
        /// Referenced identifier with no matching task
        dependency: String,
    },

    /// The graph contains a directed cycle
    ///
    /// The path reads as a closed loop: the first and last entries are
    /// the same task.
    #[error("dependency cycle: {}", path.join(" -> "))]
    CyclicDependency {
        /// The offending cycle, closed on its first node
        path: Vec<String>,
    },

    /// Lookup of an unknown task
    #[error("task {0} not found")]
    TaskNotFound(String),
}
