//! Ownership resolution
//!
//! Answers "which node owns this task's shard". The distributed lane
//! dequeue loop and the signal router both consult a resolver before
//! acting on a task. Implementations may read the coordinator's
//! ownership records, fall back to the hash ring, or use a static map
//! (tests).

use async_trait::async_trait;
use thiserror::Error;

use crate::ids::NodeId;

/// Resolution failure modes
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No node currently owns the task's shard
    #[error("no owner for task {0}")]
    NoOwner(String),
    /// The resolver's backend (coordinator, ring source) failed
    #[error("resolver backend error: {0}")]
    Backend(String),
}

/// Outcome of a successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerResolution {
    /// Owning node
    pub node: NodeId,
    /// Whether the owning node is the local node
    pub is_local: bool,
}

/// Maps a task identifier to its owning node
#[async_trait]
pub trait OwnershipResolver: Send + Sync {
    /// Resolve the owner of `task_id`'s shard
    async fn resolve_task_owner(&self, task_id: &str) -> Result<OwnerResolution, ResolveError>;
}

/// Fixed task → node map, for tests and single-node wiring
pub struct StaticResolver {
    local_node: NodeId,
    owners: parking_lot::RwLock<std::collections::HashMap<String, NodeId>>,
    /// Owner assumed when no entry exists; `None` means unowned
    default_owner: Option<NodeId>,
}

impl StaticResolver {
    /// Resolver that maps every task to the local node
    pub fn all_local(local_node: impl Into<NodeId>) -> Self {
        let local = local_node.into();
        Self {
            local_node: local.clone(),
            owners: parking_lot::RwLock::new(std::collections::HashMap::new()),
            default_owner: Some(local),
        }
    }

    /// Resolver with explicit assignments and no default owner
    pub fn with_owners(
        local_node: impl Into<NodeId>,
        owners: std::collections::HashMap<String, NodeId>,
    ) -> Self {
        Self {
            local_node: local_node.into(),
            owners: parking_lot::RwLock::new(owners),
            default_owner: None,
        }
    }

    /// Assign or move a task's owner
    pub fn assign(&self, task_id: impl Into<String>, node: impl Into<NodeId>) {
        self.owners.write().insert(task_id.into(), node.into());
    }
}

#[async_trait]
impl OwnershipResolver for StaticResolver {
    async fn resolve_task_owner(&self, task_id: &str) -> Result<OwnerResolution, ResolveError> {
        let owner = self
            .owners
            .read()
            .get(task_id)
            .cloned()
            .or_else(|| self.default_owner.clone())
            .ok_or_else(|| ResolveError::NoOwner(task_id.to_string()))?;
        let is_local = owner == self.local_node;
        Ok(OwnerResolution { node: owner, is_local })
    }
}
