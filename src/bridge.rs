//! Distributed bridge
//!
//! Combines the signal router, the coordinator-backed ownership
//! resolver, and the transfer broker. The resolver answers "who owns
//! this task's shard" from the coordinator's ownership record,
//! applying the hash ring as a fallback hint when no explicit claim
//! exists.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use troupe_cluster::{Coordinator, HashRing, TransferBroker};
use troupe_core::{
    shard_for_workflow, NodeId, OwnerResolution, OwnershipResolver, ResolveError, WorkflowId,
};
use troupe_signals::{RemotePublisher, SignalBus, SignalRouter};

/// Coordinator-backed ownership resolver.
///
/// Tasks map to workflows through an index the engine maintains while
/// dispatching; workflows map to shards deterministically; shards map
/// to nodes through the coordinator's claim or, absent one, the ring.
pub struct ClusterResolver {
    coordinator: Arc<dyn Coordinator>,
    ring: RwLock<HashRing>,
    local_node: NodeId,
    tasks: DashMap<String, WorkflowId>,
}

impl ClusterResolver {
    /// Resolver for a node
    pub fn new(coordinator: Arc<dyn Coordinator>, local_node: impl Into<NodeId>) -> Self {
        Self {
            coordinator,
            ring: RwLock::new(HashRing::new()),
            local_node: local_node.into(),
            tasks: DashMap::new(),
        }
    }

    /// Record which workflow a task belongs to (engine dispatch path)
    pub fn register_task(&self, task_id: impl Into<String>, workflow_id: WorkflowId) {
        self.tasks.insert(task_id.into(), workflow_id);
    }

    /// Forget a task after its terminal outcome
    pub fn unregister_task(&self, task_id: &str) {
        self.tasks.remove(task_id);
    }

    /// Atomically replace the ring's node set on membership changes
    pub fn set_ring_nodes<I, S>(&self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let mut ring = self.ring.write();
        ring.set_nodes(nodes);
    }
}

#[async_trait]
impl OwnershipResolver for ClusterResolver {
    async fn resolve_task_owner(&self, task_id: &str) -> Result<OwnerResolution, ResolveError> {
        let Some(workflow_id) = self.tasks.get(task_id).map(|entry| *entry.value()) else {
            return Err(ResolveError::NoOwner(task_id.to_string()));
        };
        let shard = shard_for_workflow(&workflow_id);

        let claim = self
            .coordinator
            .get_ownership(&shard)
            .await
            .map_err(|err| ResolveError::Backend(err.to_string()))?;
        if let Some(claim) = claim {
            let is_local = claim.owner == self.local_node;
            return Ok(OwnerResolution {
                node: claim.owner,
                is_local,
            });
        }

        // No explicit claim yet: the ring is a hint for who should
        // claim it.
        let hint = self.ring.read().owner(&shard).cloned();
        match hint {
            Some(node) => {
                let is_local = node == self.local_node;
                Ok(OwnerResolution { node, is_local })
            }
            None => Err(ResolveError::NoOwner(task_id.to_string())),
        }
    }
}

/// Fencing enforcement for the engine's side-effecting operations.
///
/// Holds the node's current fencing token per shard. Before a task
/// runs, the work moves to in-flight under that token; before its
/// terminal state is persisted, the token is validated against the
/// coordinator and the completion is recorded in the transfer broker,
/// which suppresses duplicate terminals across ownership moves.
pub struct FencingGuard {
    coordinator: Arc<dyn Coordinator>,
    broker: Arc<TransferBroker>,
    node_id: NodeId,
    tokens: DashMap<troupe_core::ShardKey, u64>,
}

/// Verdict for one fenced operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceVerdict {
    /// Proceed under the current token
    Allowed,
    /// The work already completed elsewhere; skip silently
    Duplicate,
    /// The node's token is stale; the operation must not run
    Rejected,
}

impl FencingGuard {
    /// Guard for a node, sharing the bridge's broker
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        broker: Arc<TransferBroker>,
        node_id: impl Into<NodeId>,
    ) -> Self {
        Self {
            coordinator,
            broker,
            node_id: node_id.into(),
            tokens: DashMap::new(),
        }
    }

    /// Adopt the token from a successful ownership claim
    pub fn set_token(&self, shard: troupe_core::ShardKey, token: u64) {
        self.broker.set_active_token(&shard, token);
        self.tokens.insert(shard, token);
    }

    fn token_for(&self, workflow_id: &WorkflowId) -> (troupe_core::ShardKey, u64) {
        let shard = shard_for_workflow(workflow_id);
        let token = self.tokens.get(&shard).map(|entry| *entry.value()).unwrap_or(0);
        (shard, token)
    }

    /// Gate one task execution start
    pub async fn begin(&self, workflow_id: &WorkflowId, work_id: &str) -> FenceVerdict {
        let (shard, token) = self.token_for(workflow_id);
        if token == 0 {
            return FenceVerdict::Rejected;
        }
        if self
            .coordinator
            .validate_fencing_token(&shard, &self.node_id, token)
            .await
            .is_err()
        {
            return FenceVerdict::Rejected;
        }
        match self.broker.start_in_flight(&shard, work_id, token) {
            Ok(true) => FenceVerdict::Allowed,
            Ok(false) => FenceVerdict::Duplicate,
            Err(_) => FenceVerdict::Rejected,
        }
    }

    /// Gate one terminal writeback
    pub async fn commit(&self, workflow_id: &WorkflowId, work_id: &str) -> FenceVerdict {
        let (shard, token) = self.token_for(workflow_id);
        if token == 0 {
            return FenceVerdict::Rejected;
        }
        if self
            .coordinator
            .validate_fencing_token(&shard, &self.node_id, token)
            .await
            .is_err()
        {
            return FenceVerdict::Rejected;
        }
        match self.broker.complete_in_flight(&shard, work_id, token) {
            Ok(true) => FenceVerdict::Allowed,
            Ok(false) => FenceVerdict::Duplicate,
            Err(_) => FenceVerdict::Rejected,
        }
    }
}

/// Router + resolver + transfer broker, wired for one node
pub struct DistributedBridge {
    /// Ownership resolver backed by the coordinator and ring
    pub resolver: Arc<ClusterResolver>,
    /// Ownership-aware signal router (implements [`SignalBus`])
    pub router: Arc<SignalRouter>,
    /// Handoff broker enforcing fencing across reassignment
    pub broker: Arc<TransferBroker>,
}

impl DistributedBridge {
    /// Wire the bridge for a node
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        local_node: impl Into<NodeId>,
        local_bus: Arc<dyn SignalBus>,
        remote: Arc<dyn RemotePublisher>,
    ) -> Self {
        let resolver = Arc::new(ClusterResolver::new(coordinator, local_node));
        let router = Arc::new(SignalRouter::new(local_bus, resolver.clone(), remote));
        Self {
            resolver,
            router,
            broker: Arc::new(TransferBroker::new()),
        }
    }
}
