//! Shared kernel for the troupe workflow engine
//!
//! Everything the member crates need to agree on without depending on
//! each other: identifiers, cooperative cancellation, the task
//! execution context, terminal outcomes, and the narrow interfaces
//! (ownership resolution, metrics) that are injected rather than
//! hard-wired.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod cancel;
pub mod context;
pub mod ids;
pub mod metrics;
pub mod outcome;
pub mod resolve;

pub use cancel::{CancelCause, CancelToken};
pub use context::{TaskContext, SIGNAL_CHANNEL_KEY};
pub use ids::{shard_for_workflow, NodeId, ShardKey, WorkflowId};
pub use metrics::{MetricsRecorder, NoopMetrics};
pub use outcome::{OutcomeKind, TaskOutcome};
pub use resolve::{OwnerResolution, OwnershipResolver, ResolveError, StaticResolver};
