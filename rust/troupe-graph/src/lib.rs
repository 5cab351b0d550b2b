//! Task graph model and DAG compiler
//!
//! A [`Graph`] is a mutable set of [`Task`]s whose dependency edges are
//! derived from each task's `deps` list. [`Graph::compile`] validates
//! the graph (missing dependencies, cycles) and produces an immutable
//! [`ExecutionPlan`]: tasks layered so that layer `k` depends only on
//! layers `< k`, plus the longest dependency chain as advisory
//! metadata.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod error;
pub mod graph;
pub mod plan;
pub mod task;

pub use error::{GraphError, GraphResult};
pub use graph::Graph;
pub use plan::ExecutionPlan;
pub use task::Task;
