//! Terminal task outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::WorkflowId;

/// How a task attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    /// Task function returned a result
    Completed,
    /// Task function returned an error, panicked, or exhausted retries
    Failed,
    /// Task was cancelled before or during execution
    Cancelled,
}

/// Terminal state reported back to the engine for a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Task identifier within the workflow
    pub task_id: String,
    /// Terminal kind
    pub kind: OutcomeKind,
    /// Result payload, present on completion
    pub result: Option<serde_json::Value>,
    /// Error description, present on failure/cancellation
    pub error: Option<String>,
    /// Set when the failure was caused by an interrupt signal rather
    /// than the task itself; the workflow finalizes as cancelled
    #[serde(default)]
    pub interrupted: bool,
    /// When the terminal state was reached
    pub finished_at: DateTime<Utc>,
}

impl TaskOutcome {
    /// Successful completion with a result payload
    pub fn completed(
        workflow_id: WorkflowId,
        task_id: impl Into<String>,
        result: serde_json::Value,
    ) -> Self {
        Self {
            workflow_id,
            task_id: task_id.into(),
            kind: OutcomeKind::Completed,
            result: Some(result),
            error: None,
            interrupted: false,
            finished_at: Utc::now(),
        }
    }

    /// Failure with an error description
    pub fn failed(
        workflow_id: WorkflowId,
        task_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id,
            task_id: task_id.into(),
            kind: OutcomeKind::Failed,
            result: None,
            error: Some(error.into()),
            interrupted: false,
            finished_at: Utc::now(),
        }
    }

    /// Cancellation, with the cause rendered as the error string
    pub fn cancelled(
        workflow_id: WorkflowId,
        task_id: impl Into<String>,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id,
            task_id: task_id.into(),
            kind: OutcomeKind::Cancelled,
            result: None,
            error: Some(cause.into()),
            interrupted: false,
            finished_at: Utc::now(),
        }
    }

    /// Failure caused by an interrupt signal
    pub fn interrupted(
        workflow_id: WorkflowId,
        task_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id,
            task_id: task_id.into(),
            kind: OutcomeKind::Failed,
            result: None,
            error: Some(format!("interrupted: {}", reason.into())),
            interrupted: true,
            finished_at: Utc::now(),
        }
    }

    /// Whether the outcome is terminal-successful
    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Completed
    }
}
