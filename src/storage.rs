//! Storage interface and the in-memory reference implementation
//!
//! Persistence backends are external collaborators; the engine only
//! depends on this trait. The in-memory implementation backs tests and
//! single-process deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use troupe_core::WorkflowId;

use crate::workflow::{TaskRecord, WorkflowSnapshot, WorkflowState};

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Typed storage failures the engine reacts to
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// No record under the requested key
    #[error("not found: {0}")]
    NotFound(String),

    /// Insert collided with an existing key
    #[error("duplicate key: {0}")]
    Duplicate(String),

    /// Backend failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Listing filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowFilter {
    /// Only workflows in this state
    pub state: Option<WorkflowState>,
    /// Only workflows whose name starts with this prefix
    pub name_prefix: Option<String>,
    /// Cap the number of results
    pub limit: Option<usize>,
}

impl WorkflowFilter {
    fn matches(&self, snapshot: &WorkflowSnapshot) -> bool {
        if let Some(state) = self.state {
            if snapshot.state != state {
                return false;
            }
        }
        if let Some(prefix) = &self.name_prefix {
            if !snapshot.name.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// What the engine needs from a persistence backend
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a new workflow snapshot; duplicate ids are rejected
    async fn save_workflow(&self, snapshot: &WorkflowSnapshot) -> StorageResult<()>;

    /// Replace an existing workflow snapshot
    async fn update_workflow(&self, snapshot: &WorkflowSnapshot) -> StorageResult<()>;

    /// Fetch a workflow snapshot
    async fn get_workflow(&self, id: &WorkflowId) -> StorageResult<WorkflowSnapshot>;

    /// List workflows matching the filter, newest first
    async fn list_workflows(&self, filter: &WorkflowFilter) -> StorageResult<Vec<WorkflowSnapshot>>;

    /// Persist one task's record inside its workflow snapshot
    async fn save_task_state(
        &self,
        id: &WorkflowId,
        task_id: &str,
        record: TaskRecord,
    ) -> StorageResult<()>;

    /// Fetch one task's record
    async fn get_task_state(&self, id: &WorkflowId, task_id: &str) -> StorageResult<TaskRecord>;

    /// Delete a workflow and, cascading, its task records
    async fn delete_workflow(&self, id: &WorkflowId) -> StorageResult<()>;
}

/// Reference implementation over a concurrent map
#[derive(Default)]
pub struct MemoryStorage {
    workflows: DashMap<WorkflowId, WorkflowSnapshot>,
}

impl MemoryStorage {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_workflow(&self, snapshot: &WorkflowSnapshot) -> StorageResult<()> {
        if self.workflows.contains_key(&snapshot.id) {
            return Err(StorageError::Duplicate(snapshot.id.to_string()));
        }
        self.workflows.insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn update_workflow(&self, snapshot: &WorkflowSnapshot) -> StorageResult<()> {
        if !self.workflows.contains_key(&snapshot.id) {
            return Err(StorageError::NotFound(snapshot.id.to_string()));
        }
        self.workflows.insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &WorkflowId) -> StorageResult<WorkflowSnapshot> {
        self.workflows
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn list_workflows(&self, filter: &WorkflowFilter) -> StorageResult<Vec<WorkflowSnapshot>> {
        let mut snapshots: Vec<WorkflowSnapshot> = self
            .workflows
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|snapshot| filter.matches(snapshot))
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            snapshots.truncate(limit);
        }
        Ok(snapshots)
    }

    async fn save_task_state(
        &self,
        id: &WorkflowId,
        task_id: &str,
        record: TaskRecord,
    ) -> StorageResult<()> {
        let mut entry = self
            .workflows
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        entry.tasks.insert(task_id.to_string(), record);
        Ok(())
    }

    async fn get_task_state(&self, id: &WorkflowId, task_id: &str) -> StorageResult<TaskRecord> {
        let entry = self
            .workflows
            .get(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        entry
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", id, task_id)))
    }

    async fn delete_workflow(&self, id: &WorkflowId) -> StorageResult<()> {
        self.workflows
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowSubmission;

    fn snapshot(name: &str) -> WorkflowSnapshot {
        let submission: WorkflowSubmission = serde_json::from_value(serde_json::json!({
            "name": name,
            "tasks": [{"id": "a", "name": "A"}]
        }))
        .unwrap();
        WorkflowSnapshot::new(WorkflowId::new(), submission)
    }

    #[tokio::test]
    async fn test_save_rejects_duplicate_id() {
        let storage = MemoryStorage::new();
        let snap = snapshot("wf");
        storage.save_workflow(&snap).await.unwrap();
        assert!(matches!(
            storage.save_workflow(&snap).await,
            Err(StorageError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_update_requires_existing() {
        let storage = MemoryStorage::new();
        let snap = snapshot("wf");
        assert!(matches!(
            storage.update_workflow(&snap).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_task_state_roundtrip() {
        let storage = MemoryStorage::new();
        let snap = snapshot("wf");
        storage.save_workflow(&snap).await.unwrap();

        let mut record = TaskRecord::pending();
        record.state = crate::workflow::TaskRunState::Running;
        storage.save_task_state(&snap.id, "a", record.clone()).await.unwrap();
        let loaded = storage.get_task_state(&snap.id, "a").await.unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let storage = MemoryStorage::new();
        let snap = snapshot("wf");
        storage.save_workflow(&snap).await.unwrap();
        storage.delete_workflow(&snap.id).await.unwrap();
        assert!(matches!(
            storage.get_task_state(&snap.id, "a").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_with_filters() {
        let storage = MemoryStorage::new();
        storage.save_workflow(&snapshot("etl-a")).await.unwrap();
        storage.save_workflow(&snapshot("etl-b")).await.unwrap();
        storage.save_workflow(&snapshot("other")).await.unwrap();

        let filter = WorkflowFilter {
            name_prefix: Some("etl".to_string()),
            ..Default::default()
        };
        assert_eq!(storage.list_workflows(&filter).await.unwrap().len(), 2);

        let limited = WorkflowFilter {
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(storage.list_workflows(&limited).await.unwrap().len(), 1);
    }
}
