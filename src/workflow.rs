//! Workflow wire schemas and persisted state

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use troupe_core::{OutcomeKind, TaskOutcome, WorkflowId};
use troupe_graph::{Graph, GraphResult, Task};

/// Workflow lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    /// Accepted, not yet executing
    Pending,
    /// Layers are being dispatched
    Running,
    /// Every task completed
    Completed,
    /// A task failed terminally
    Failed,
    /// Cancelled by request or interrupt
    Cancelled,
}

impl WorkflowState {
    /// Whether the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One task in a workflow submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Stable identifier, unique within the submission
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Free-form task type tag
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    /// Agent kind; defaults to the `default` agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Lane name; defaults to the `default` lane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    /// Identifiers of tasks this one depends on
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Execution timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Retry budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Opaque input payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskSpec {
    /// Minimal spec with identity only
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            task_type: None,
            agent: None,
            lane: None,
            depends_on: Vec::new(),
            timeout: None,
            retries: None,
            input: None,
            metadata: HashMap::new(),
        }
    }

    /// Set dependencies
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the lane
    pub fn on_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }

    /// Set the agent kind
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    /// Set the input payload
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    fn into_task(self) -> Task {
        let mut task = Task::new(self.id, self.name).with_deps(self.depends_on);
        if let Some(agent) = self.agent {
            task = task.with_agent(agent);
        }
        if let Some(lane) = self.lane {
            task = task.with_lane(lane);
        }
        if let Some(timeout) = self.timeout {
            task.timeout_ms = Some((timeout * 1000.0) as u64);
        }
        if let Some(retries) = self.retries {
            task = task.with_retries(retries);
        }
        if let Some(input) = self.input {
            task = task.with_input(input);
        }
        let mut metadata = self.metadata;
        if let Some(task_type) = self.task_type {
            metadata.insert("type".to_string(), serde_json::json!(task_type));
        }
        task.metadata = metadata;
        task
    }
}

/// Workflow submission: the wire contract with external façades
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSubmission {
    /// Workflow name
    pub name: String,
    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Task set
    pub tasks: Vec<TaskSpec>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowSubmission {
    /// Build the mutable graph this submission describes
    pub fn build_graph(&self) -> GraphResult<Graph> {
        let mut graph = Graph::new();
        for spec in &self.tasks {
            graph.add_task(spec.clone().into_task())?;
        }
        Ok(graph)
    }
}

/// Submission acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// Assigned workflow identifier
    pub id: WorkflowId,
    /// State at acceptance
    pub status: WorkflowState,
}

/// Per-task execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskRunState {
    /// Not yet dispatched
    Pending,
    /// Admitted into its lane
    Queued,
    /// Executing on a worker
    Running,
    /// Terminal: success
    Completed,
    /// Terminal: failure
    Failed,
    /// Terminal: cancelled
    Cancelled,
}

impl TaskRunState {
    /// Whether the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskRunState::Completed | TaskRunState::Failed | TaskRunState::Cancelled
        )
    }
}

/// Persisted record for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Current state
    pub state: TaskRunState,
    /// Result payload on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error string on failure or cancellation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts consumed
    #[serde(default)]
    pub attempts: u32,
    /// When a terminal state was reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Fresh, pre-dispatch record
    pub fn pending() -> Self {
        Self {
            state: TaskRunState::Pending,
            result: None,
            error: None,
            attempts: 0,
            finished_at: None,
        }
    }

    /// Record for a terminal outcome
    pub fn from_outcome(outcome: &TaskOutcome, attempts: u32) -> Self {
        let state = match outcome.kind {
            OutcomeKind::Completed => TaskRunState::Completed,
            OutcomeKind::Failed => TaskRunState::Failed,
            OutcomeKind::Cancelled => TaskRunState::Cancelled,
        };
        Self {
            state,
            result: outcome.result.clone(),
            error: outcome.error.clone(),
            attempts,
            finished_at: Some(outcome.finished_at),
        }
    }
}

/// Persisted workflow snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Workflow identifier
    pub id: WorkflowId,
    /// Submitted name
    pub name: String,
    /// Submitted description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Lifecycle state
    pub state: WorkflowState,
    /// Original submission, kept for recovery replay
    pub submission: WorkflowSubmission,
    /// Per-task records
    #[serde(default)]
    pub tasks: HashMap<String, TaskRecord>,
    /// Workflow-level error, if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Execution start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowSnapshot {
    /// Fresh snapshot for an accepted submission
    pub fn new(id: WorkflowId, submission: WorkflowSubmission) -> Self {
        let tasks = submission
            .tasks
            .iter()
            .map(|spec| (spec.id.clone(), TaskRecord::pending()))
            .collect();
        Self {
            id,
            name: submission.name.clone(),
            description: submission.description.clone(),
            state: WorkflowState::Pending,
            submission,
            tasks,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Wire-facing status view
    pub fn status(&self) -> WorkflowStatus {
        let mut tasks: Vec<TaskStatus> = self
            .submission
            .tasks
            .iter()
            .map(|spec| {
                let record = self.tasks.get(&spec.id).cloned().unwrap_or_else(TaskRecord::pending);
                TaskStatus {
                    id: spec.id.clone(),
                    name: spec.name.clone(),
                    state: record.state,
                    result: record.result,
                    error: record.error,
                }
            })
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        WorkflowStatus {
            id: self.id,
            name: self.name.clone(),
            status: self.state,
            tasks,
            error: self.error.clone(),
        }
    }
}

/// Wire-facing task status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Task identifier
    pub id: String,
    /// Task name
    pub name: String,
    /// Current state
    pub state: TaskRunState,
    /// Result payload, if completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error, if failed or cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Wire-facing workflow status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    /// Workflow identifier
    pub id: WorkflowId,
    /// Workflow name
    pub name: String,
    /// Lifecycle state
    pub status: WorkflowState,
    /// Per-task status, sorted by identifier
    pub tasks: Vec<TaskStatus>,
    /// Workflow-level error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_wire_parse() {
        let raw = serde_json::json!({
            "name": "etl",
            "tasks": [
                {"id": "extract", "name": "Extract", "lane": "io"},
                {"id": "load", "name": "Load", "depends_on": ["extract"], "timeout": 2.5, "retries": 1}
            ]
        });
        let submission: WorkflowSubmission = serde_json::from_value(raw).unwrap();
        assert_eq!(submission.tasks.len(), 2);
        let mut graph = submission.build_graph().unwrap();
        let plan = graph.compile().unwrap();
        assert_eq!(plan.depth(), 2);
        let load = plan.task("load").unwrap();
        assert_eq!(load.timeout_ms, Some(2500));
        assert_eq!(load.retries, 1);
    }

    #[test]
    fn test_snapshot_status_view() {
        let submission: WorkflowSubmission = serde_json::from_value(serde_json::json!({
            "name": "wf",
            "tasks": [{"id": "a", "name": "A"}]
        }))
        .unwrap();
        let snapshot = WorkflowSnapshot::new(WorkflowId::new(), submission);
        let status = snapshot.status();
        assert_eq!(status.status, WorkflowState::Pending);
        assert_eq!(status.tasks.len(), 1);
        assert_eq!(status.tasks[0].state, TaskRunState::Pending);
    }

    #[test]
    fn test_terminal_states() {
        assert!(WorkflowState::Completed.is_terminal());
        assert!(!WorkflowState::Running.is_terminal());
        assert!(TaskRunState::Cancelled.is_terminal());
        assert!(!TaskRunState::Queued.is_terminal());
    }
}
