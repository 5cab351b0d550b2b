//! Task execution context
//!
//! Handed to every task function by the lane worker. Carries identity,
//! the input payload, the cancellation token derived from the caller's
//! context and the lane shutdown token, and a small extension map the
//! runtime uses to inject per-task facilities (the signal channel in
//! particular) under well-known keys.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::ids::WorkflowId;

/// Extension key under which the worker runtime injects the task's
/// signal subscription. Task code that never looks it up simply lets
/// the subscription buffer and drop.
pub const SIGNAL_CHANNEL_KEY: &str = "troupe.signals";

type Extension = Arc<dyn Any + Send + Sync>;

/// Execution context for a single task attempt
#[derive(Clone)]
pub struct TaskContext {
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Task identifier within the workflow
    pub task_id: String,
    /// Opaque input payload
    pub payload: serde_json::Value,
    cancel: CancelToken,
    extensions: Arc<Mutex<HashMap<String, Extension>>>,
}

impl TaskContext {
    /// Create a context for a task attempt
    pub fn new(
        workflow_id: WorkflowId,
        task_id: impl Into<String>,
        payload: serde_json::Value,
        cancel: CancelToken,
    ) -> Self {
        Self {
            workflow_id,
            task_id: task_id.into(),
            payload,
            cancel,
            extensions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The cancellation token for this attempt
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Whether the attempt has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the attempt is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Inject an extension under a well-known key
    pub fn insert_extension<T: Any + Send + Sync>(&self, key: &str, value: Arc<T>) {
        self.extensions.lock().insert(key.to_string(), value);
    }

    /// Look up an extension by key and type
    pub fn extension<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let guard = self.extensions.lock();
        guard.get(key).cloned().and_then(|ext| ext.downcast::<T>().ok())
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("workflow_id", &self.workflow_id)
            .field("task_id", &self.task_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_roundtrip() {
        let ctx = TaskContext::new(
            WorkflowId::new(),
            "t1",
            serde_json::Value::Null,
            CancelToken::new(),
        );
        ctx.insert_extension(SIGNAL_CHANNEL_KEY, Arc::new(42u64));
        assert_eq!(ctx.extension::<u64>(SIGNAL_CHANNEL_KEY), Some(Arc::new(42u64)));
    }

    #[test]
    fn test_extension_wrong_type_is_none() {
        let ctx = TaskContext::new(
            WorkflowId::new(),
            "t1",
            serde_json::Value::Null,
            CancelToken::new(),
        );
        ctx.insert_extension(SIGNAL_CHANNEL_KEY, Arc::new(42u64));
        assert!(ctx.extension::<String>(SIGNAL_CHANNEL_KEY).is_none());
    }
}
