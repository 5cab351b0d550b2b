//! Troupe: multi-agent workflow orchestration engine
//!
//! Workflows are directed acyclic task graphs; each task names a
//! dependency set and a resource class (lane). The engine compiles a
//! submission into a layered execution plan, dispatches each layer
//! into its lanes, executes task functions through a registry of
//! agents with signal-capable contexts, and persists terminal state
//! through an injected storage interface. Distributed deployments add
//! cluster coordination (membership, leader election, fenced shard
//! ownership) and cross-node signal routing.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod agent;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod storage;
pub mod workflow;

pub use agent::{AgentHandler, AgentRegistry, FnAgent};
pub use bridge::{ClusterResolver, DistributedBridge, FenceVerdict, FencingGuard};
pub use config::TroupeConfig;
pub use engine::{Engine, EngineBuilder, EngineSettings, EngineStats, SignalRequest};
pub use error::{EngineError, EngineResult};
pub use storage::{MemoryStorage, Storage, StorageError, WorkflowFilter};
pub use workflow::{
    SubmitReceipt, TaskRecord, TaskRunState, TaskSpec, TaskStatus, WorkflowSnapshot,
    WorkflowState, WorkflowStatus, WorkflowSubmission,
};

pub use troupe_core::{
    CancelCause, CancelToken, MetricsRecorder, NoopMetrics, OutcomeKind, TaskContext, TaskOutcome,
    WorkflowId,
};
pub use troupe_graph::{ExecutionPlan, Graph, GraphError, Task};
