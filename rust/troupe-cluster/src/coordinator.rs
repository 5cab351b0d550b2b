//! Coordinator contract and the in-memory reference implementation

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use troupe_core::{NodeId, ShardKey};

use crate::error::{CoordinationError, CoordinationResult};
use crate::types::{
    ClaimRequest, LeaderLease, LeaseId, MembershipEvent, NodeHealth, NodeRegistration, NodeState,
    OwnershipClaim,
};

/// Capacity of the membership watch channel; laggards drop events
const WATCH_CAPACITY: usize = 256;

/// Membership, leadership, and fenced ownership.
///
/// Implementations must keep single-shard transitions linearizable and
/// fencing tokens strictly monotonic per shard key; the in-memory
/// reference captures the required semantics for etcd/Consul/Redis
/// backends to preserve.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Register a node and issue its membership lease
    async fn join(&self, registration: NodeRegistration, ttl: Duration)
        -> CoordinationResult<NodeState>;

    /// Refresh a node's lease and health
    async fn heartbeat(
        &self,
        node_id: &str,
        lease_id: &LeaseId,
        ttl: Duration,
    ) -> CoordinationResult<NodeState>;

    /// Gracefully remove a node
    async fn leave(&self, node_id: &str, lease_id: &LeaseId) -> CoordinationResult<()>;

    /// All membership records
    async fn list_nodes(&self) -> CoordinationResult<Vec<NodeState>>;

    /// Subscribe to membership events (best-effort, bounded)
    fn watch(&self) -> broadcast::Receiver<MembershipEvent>;

    /// Attempt to take the leader lease
    async fn acquire_leader_lease(
        &self,
        node_id: &str,
        ttl: Duration,
    ) -> CoordinationResult<LeaderLease>;

    /// Extend a held leader lease
    async fn renew_leader_lease(
        &self,
        node_id: &str,
        lease_id: &LeaseId,
        ttl: Duration,
    ) -> CoordinationResult<LeaderLease>;

    /// Give the leader lease up
    async fn release_leader_lease(
        &self,
        node_id: &str,
        lease_id: &LeaseId,
    ) -> CoordinationResult<()>;

    /// The live leader lease, if any
    async fn current_leader(&self) -> CoordinationResult<Option<LeaderLease>>;

    /// Claim or renew ownership of a shard
    async fn claim_ownership(&self, request: ClaimRequest) -> CoordinationResult<OwnershipClaim>;

    /// The live claim for a shard, if any
    async fn get_ownership(&self, shard: &ShardKey) -> CoordinationResult<Option<OwnershipClaim>>;

    /// Release a shard claim held with the given token
    async fn release_ownership(
        &self,
        shard: &ShardKey,
        node_id: &str,
        token: u64,
    ) -> CoordinationResult<()>;

    /// Accept only the exact current fencing token for the shard.
    ///
    /// Token 0 is never valid.
    async fn validate_fencing_token(
        &self,
        shard: &ShardKey,
        node_id: &str,
        token: u64,
    ) -> CoordinationResult<()>;
}

#[derive(Default)]
struct CoordinatorState {
    nodes: HashMap<NodeId, NodeState>,
    leader: Option<LeaderLease>,
    claims: HashMap<ShardKey, OwnershipClaim>,
    /// Highest token ever issued per shard; survives claim releases so
    /// monotonicity holds across re-claims.
    tokens: HashMap<ShardKey, u64>,
}

/// Reference coordinator: every record behind one mutex, transitions
/// atomic per call.
pub struct MemoryCoordinator {
    state: Mutex<CoordinatorState>,
    events: broadcast::Sender<MembershipEvent>,
}

impl MemoryCoordinator {
    /// Empty coordinator
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Mutex::new(CoordinatorState::default()),
            events,
        }
    }

    fn emit(&self, event: MembershipEvent) {
        // Best-effort: no receivers is fine, lagging receivers drop.
        let _ = self.events.send(event);
    }

    fn expiry(ttl: Duration) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30))
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn join(
        &self,
        registration: NodeRegistration,
        ttl: Duration,
    ) -> CoordinationResult<NodeState> {
        let node = NodeState {
            node_id: registration.node_id.clone(),
            address: registration.address,
            metadata: registration.metadata,
            health: NodeHealth::Healthy,
            lease_id: LeaseId::new(),
            last_heartbeat: Utc::now(),
            lease_expires_at: Self::expiry(ttl),
        };
        self.state
            .lock()
            .nodes
            .insert(registration.node_id, node.clone());
        tracing::info!(node = %node.node_id, "node joined");
        self.emit(MembershipEvent::Joined(node.clone()));
        Ok(node)
    }

    async fn heartbeat(
        &self,
        node_id: &str,
        lease_id: &LeaseId,
        ttl: Duration,
    ) -> CoordinationResult<NodeState> {
        let (node, health_changed) = {
            let mut state = self.state.lock();
            let node = state
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| CoordinationError::NodeNotFound(node_id.to_string()))?;
            if node.lease_id != *lease_id {
                return Err(CoordinationError::LeaseMismatch(node_id.to_string()));
            }
            if node.lease_expires_at < Utc::now() {
                return Err(CoordinationError::LeaseExpired(node_id.to_string()));
            }
            let health_changed = node.health != NodeHealth::Healthy;
            node.health = NodeHealth::Healthy;
            node.last_heartbeat = Utc::now();
            node.lease_expires_at = Self::expiry(ttl);
            (node.clone(), health_changed)
        };
        self.emit(MembershipEvent::Heartbeat {
            node_id: node_id.to_string(),
        });
        if health_changed {
            self.emit(MembershipEvent::StateChanged {
                node_id: node_id.to_string(),
                health: NodeHealth::Healthy,
            });
        }
        Ok(node)
    }

    async fn leave(&self, node_id: &str, lease_id: &LeaseId) -> CoordinationResult<()> {
        let released_leadership = {
            let mut state = self.state.lock();
            let node = state
                .nodes
                .get(node_id)
                .ok_or_else(|| CoordinationError::NodeNotFound(node_id.to_string()))?;
            if node.lease_id != *lease_id {
                return Err(CoordinationError::LeaseMismatch(node_id.to_string()));
            }
            state.nodes.remove(node_id);
            let released = state
                .leader
                .as_ref()
                .map(|lease| lease.holder == node_id)
                .unwrap_or(false);
            if released {
                state.leader = None;
            }
            released
        };
        tracing::info!(node = %node_id, "node left");
        self.emit(MembershipEvent::StateChanged {
            node_id: node_id.to_string(),
            health: NodeHealth::Leaving,
        });
        self.emit(MembershipEvent::Left {
            node_id: node_id.to_string(),
        });
        if released_leadership {
            self.emit(MembershipEvent::LeaderChanged { leader: None });
        }
        Ok(())
    }

    async fn list_nodes(&self) -> CoordinationResult<Vec<NodeState>> {
        let mut nodes: Vec<NodeState> = self.state.lock().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    fn watch(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    async fn acquire_leader_lease(
        &self,
        node_id: &str,
        ttl: Duration,
    ) -> CoordinationResult<LeaderLease> {
        let lease = {
            let mut state = self.state.lock();
            if let Some(current) = &state.leader {
                let live = current.expires_at > Utc::now();
                if live && current.holder != node_id {
                    return Err(CoordinationError::LeaderLeaseHeld {
                        holder: current.holder.clone(),
                    });
                }
                if live && current.holder == node_id {
                    // Re-acquire by the holder extends the lease.
                    let mut renewed = current.clone();
                    renewed.expires_at = Self::expiry(ttl);
                    state.leader = Some(renewed.clone());
                    return Ok(renewed);
                }
            }
            let lease = LeaderLease {
                lease_id: LeaseId::new(),
                holder: node_id.to_string(),
                expires_at: Self::expiry(ttl),
            };
            state.leader = Some(lease.clone());
            lease
        };
        tracing::info!(node = %node_id, "leader lease acquired");
        self.emit(MembershipEvent::LeaderChanged {
            leader: Some(node_id.to_string()),
        });
        Ok(lease)
    }

    async fn renew_leader_lease(
        &self,
        node_id: &str,
        lease_id: &LeaseId,
        ttl: Duration,
    ) -> CoordinationResult<LeaderLease> {
        let mut state = self.state.lock();
        let current = state
            .leader
            .as_mut()
            .ok_or_else(|| CoordinationError::LeaseExpired(node_id.to_string()))?;
        if current.holder != node_id || current.lease_id != *lease_id {
            return Err(CoordinationError::LeaseMismatch(node_id.to_string()));
        }
        if current.expires_at < Utc::now() {
            return Err(CoordinationError::LeaseExpired(node_id.to_string()));
        }
        current.expires_at = Self::expiry(ttl);
        Ok(current.clone())
    }

    async fn release_leader_lease(
        &self,
        node_id: &str,
        lease_id: &LeaseId,
    ) -> CoordinationResult<()> {
        {
            let mut state = self.state.lock();
            let held = match &state.leader {
                Some(current) => {
                    if current.holder != node_id || current.lease_id != *lease_id {
                        return Err(CoordinationError::LeaseMismatch(current.holder.clone()));
                    }
                    true
                }
                None => false,
            };
            if !held {
                return Ok(());
            }
            state.leader = None;
        }
        self.emit(MembershipEvent::LeaderChanged { leader: None });
        Ok(())
    }

    async fn current_leader(&self) -> CoordinationResult<Option<LeaderLease>> {
        let state = self.state.lock();
        Ok(state
            .leader
            .clone()
            .filter(|lease| lease.expires_at > Utc::now()))
    }

    async fn claim_ownership(&self, request: ClaimRequest) -> CoordinationResult<OwnershipClaim> {
        let mut state = self.state.lock();

        // The claiming node's membership lease must be live.
        let node = state
            .nodes
            .get(&request.node_id)
            .ok_or_else(|| CoordinationError::NodeNotFound(request.node_id.clone()))?;
        if node.lease_id != request.lease_id {
            return Err(CoordinationError::LeaseMismatch(request.node_id.clone()));
        }
        if node.lease_expires_at < Utc::now() {
            return Err(CoordinationError::LeaseExpired(request.node_id.clone()));
        }

        if let Some(current) = state.claims.get(&request.shard) {
            let live = current.expires_at > Utc::now();
            if live && current.owner != request.node_id {
                return Err(CoordinationError::OwnershipConflict {
                    shard: request.shard,
                    owner: current.owner.clone(),
                });
            }
            if live && current.owner == request.node_id {
                // Renewal preserves the token and extends expiry only.
                let mut renewed = current.clone();
                renewed.expires_at = Self::expiry(request.ttl);
                renewed.owner_lease = request.lease_id;
                state.claims.insert(request.shard.clone(), renewed.clone());
                return Ok(renewed);
            }
        }

        let token = {
            let counter = state.tokens.entry(request.shard.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let claim = OwnershipClaim {
            shard: request.shard.clone(),
            owner: request.node_id,
            owner_lease: request.lease_id,
            fencing_token: token,
            expires_at: Self::expiry(request.ttl),
        };
        state.claims.insert(request.shard, claim.clone());
        tracing::debug!(
            shard = %claim.shard,
            owner = %claim.owner,
            token = claim.fencing_token,
            "ownership claimed"
        );
        Ok(claim)
    }

    async fn get_ownership(&self, shard: &ShardKey) -> CoordinationResult<Option<OwnershipClaim>> {
        let state = self.state.lock();
        Ok(state
            .claims
            .get(shard)
            .filter(|claim| claim.expires_at > Utc::now())
            .cloned())
    }

    async fn release_ownership(
        &self,
        shard: &ShardKey,
        node_id: &str,
        token: u64,
    ) -> CoordinationResult<()> {
        let mut state = self.state.lock();
        let Some(current) = state.claims.get(shard) else {
            return Ok(());
        };
        if current.owner != node_id {
            return Err(CoordinationError::OwnershipConflict {
                shard: shard.clone(),
                owner: current.owner.clone(),
            });
        }
        if current.fencing_token != token {
            return Err(CoordinationError::InvalidFencingToken {
                shard: shard.clone(),
                token,
            });
        }
        state.claims.remove(shard);
        Ok(())
    }

    async fn validate_fencing_token(
        &self,
        shard: &ShardKey,
        node_id: &str,
        token: u64,
    ) -> CoordinationResult<()> {
        if token == 0 {
            return Err(CoordinationError::InvalidFencingToken {
                shard: shard.clone(),
                token,
            });
        }
        let state = self.state.lock();
        let claim = state.claims.get(shard).ok_or_else(|| {
            CoordinationError::InvalidFencingToken {
                shard: shard.clone(),
                token,
            }
        })?;
        if claim.owner != node_id
            || claim.fencing_token != token
            || claim.expires_at < Utc::now()
        {
            return Err(CoordinationError::InvalidFencingToken {
                shard: shard.clone(),
                token,
            });
        }
        Ok(())
    }
}
