//! Declarative task model

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lane used when a task does not declare one
pub const DEFAULT_LANE: &str = "default";

/// Agent kind used when a task does not declare one
pub const DEFAULT_AGENT: &str = "default";

/// Declarative unit of work within a workflow
///
/// Tasks reference their dependencies by identifier only, never by
/// pointer, so forward and backward navigation never introduces
/// ownership cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier, unique within the workflow
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Opaque dispatch tag resolved through the agent registry
    #[serde(default = "default_agent")]
    pub agent: String,
    /// Resource class the task is admitted into
    #[serde(default = "default_lane")]
    pub lane: String,
    /// Identifiers of sibling tasks this task depends on
    #[serde(default)]
    pub deps: Vec<String>,
    /// Optional execution timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retry budget for failed attempts
    #[serde(default)]
    pub retries: u32,
    /// Opaque input payload
    #[serde(default)]
    pub input: serde_json::Value,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_lane() -> String {
    DEFAULT_LANE.to_string()
}

fn default_agent() -> String {
    DEFAULT_AGENT.to_string()
}

impl Task {
    /// Create a task with defaults for everything but identity
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            agent: default_agent(),
            lane: default_lane(),
            deps: Vec::new(),
            timeout_ms: None,
            retries: 0,
            input: serde_json::Value::Null,
            metadata: HashMap::new(),
        }
    }

    /// Set the agent kind
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    /// Set the lane name
    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = lane.into();
        self
    }

    /// Declare dependencies by identifier
    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the execution timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the input payload
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// The execution timeout, if declared
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}
