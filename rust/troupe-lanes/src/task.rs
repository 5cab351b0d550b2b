//! Runtime envelope for a task admitted into a lane

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use troupe_core::WorkflowId;

/// Envelope a lane carries from admission to execution
///
/// Created on submission and released once a terminal outcome is
/// recorded for the attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneTask {
    /// Task identifier within the workflow
    pub task_id: String,
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Ordering priority; higher runs earlier
    #[serde(default)]
    pub priority: i32,
    /// When the envelope was created
    pub enqueued_at: DateTime<Utc>,
    /// Opaque payload handed to the task function
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Admission deduplication key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
}

impl LaneTask {
    /// Create an envelope with default priority and no dedup key
    pub fn new(
        workflow_id: WorkflowId,
        task_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            workflow_id,
            priority: 0,
            enqueued_at: Utc::now(),
            payload,
            dedup_key: None,
        }
    }

    /// Set the ordering priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the deduplication key
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}
