//! Lane scheduling layer
//!
//! A lane is a resource-class queue: admission under a backpressure
//! policy, priority or FIFO ordering, an optional token-bucket rate
//! limit, and a pool of worker loops executing tasks through an
//! injected [`TaskRunner`]. Two substrates implement the same
//! [`Lane`] contract: [`LocalLane`] (in-memory) and [`RedisLane`]
//! (list/sorted-set backed, with atomic Lua admission and degraded
//! mode). [`LaneManager`] maps lane names to instances and routes
//! submissions.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod config;
pub mod error;
pub mod local;
pub mod manager;
pub mod queue;
pub mod redis_lane;
pub mod runner;
pub mod task;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use troupe_core::CancelToken;

pub use config::{BackpressurePolicy, DegradedMode, LaneBackend, LaneConfig, RateLimitConfig};
pub use error::{LaneError, LaneResult};
pub use local::LocalLane;
pub use manager::{LaneManager, LaneManagerBuilder};
pub use redis_lane::{RedisLane, RedisLaneSettings};
pub use runner::{FnRunner, TaskRunner};
pub use task::LaneTask;

/// How an admission call concluded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitOutcome {
    /// Task was queued on this lane
    Admitted,
    /// Lane was full; the task was forwarded to the fallback lane
    Redirected {
        /// Lane that received the task instead
        to: String,
    },
    /// A task with the same deduplication key is already active
    Deduplicated,
}

/// Point-in-time lane statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaneStats {
    /// Lane name
    pub name: String,
    /// Tasks currently queued
    pub depth: usize,
    /// Tasks currently executing
    pub in_flight: usize,
    /// Terminal outcomes observed, by kind
    pub processed: u64,
    /// Failed terminal outcomes (subset of `processed`)
    pub failed: u64,
    /// Cancelled terminal outcomes (subset of `processed`)
    pub cancelled: u64,
    /// Admissions forwarded to a fallback lane
    pub redirected: u64,
    /// Admissions rejected at capacity
    pub dropped: u64,
    /// Admissions suppressed by a deduplication key
    pub deduplicated: u64,
    /// Whether the substrate is currently degraded
    pub degraded: bool,
}

/// A resource-class task queue
#[async_trait]
pub trait Lane: Send + Sync {
    /// Lane name
    fn name(&self) -> &str;

    /// Admit a task, honoring the lane's backpressure policy.
    ///
    /// Under the Block policy this waits for capacity (and a rate
    /// token) until `ctx` is cancelled.
    async fn submit(&self, ctx: &CancelToken, task: LaneTask) -> LaneResult<SubmitOutcome>;

    /// Admit without waiting for capacity or rate tokens.
    ///
    /// Still awaits substrate I/O; "non-blocking" refers to
    /// backpressure, not the wire.
    async fn try_submit(&self, task: LaneTask) -> LaneResult<SubmitOutcome>;

    /// Remove a still-queued task, for the interrupt pattern.
    ///
    /// Returns the removed envelope when the task had not yet been
    /// dequeued by a worker.
    async fn cancel_queued(&self, task_id: &str) -> Option<LaneTask>;

    /// Snapshot of current statistics
    async fn stats(&self) -> LaneStats;

    /// Stop intake, cancel workers, and release resources
    async fn close(&self);
}
