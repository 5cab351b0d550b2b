//! Coordination records

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use troupe_core::{NodeId, ShardKey};

/// Time-bounded holder identifier for membership, leadership, and
/// ownership records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    /// Issue a fresh lease identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node health as tracked by membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    /// Not yet observed
    Unknown,
    /// Heartbeating within its lease
    Healthy,
    /// Missed heartbeats past the failure threshold
    Unhealthy,
    /// Announced a graceful departure
    Leaving,
}

/// What a node presents when joining
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistration {
    /// Node identifier
    pub node_id: NodeId,
    /// Reachable address
    pub address: String,
    /// Free-form metadata (zone, capacity hints)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NodeRegistration {
    /// Registration with empty metadata
    pub fn new(node_id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Membership record for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// Node identifier
    pub node_id: NodeId,
    /// Reachable address
    pub address: String,
    /// Free-form metadata
    pub metadata: BTreeMap<String, String>,
    /// Current health
    pub health: NodeHealth,
    /// Membership lease
    pub lease_id: LeaseId,
    /// Last accepted heartbeat
    pub last_heartbeat: DateTime<Utc>,
    /// When the lease lapses without a heartbeat
    pub lease_expires_at: DateTime<Utc>,
}

/// Singleton leadership record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderLease {
    /// Lease identifier
    pub lease_id: LeaseId,
    /// Holding node
    pub holder: NodeId,
    /// Expiry without renewal
    pub expires_at: DateTime<Utc>,
}

/// Per-shard ownership record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipClaim {
    /// Shard key
    pub shard: ShardKey,
    /// Owning node
    pub owner: NodeId,
    /// The owner's membership lease at claim time
    pub owner_lease: LeaseId,
    /// Monotonically increasing per shard key; the stored value is the
    /// highest ever issued, and any operation bearing another value
    /// must be rejected
    pub fencing_token: u64,
    /// Claim expiry
    pub expires_at: DateTime<Utc>,
}

/// Ownership claim request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Shard to claim
    pub shard: ShardKey,
    /// Claiming node
    pub node_id: NodeId,
    /// The claiming node's membership lease
    pub lease_id: LeaseId,
    /// Claim TTL
    pub ttl: std::time::Duration,
}

/// Events on the membership watch stream
///
/// Delivery is best-effort over a bounded channel; slow consumers drop
/// events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node joined
    Joined(NodeState),
    /// A node heartbeat was accepted
    Heartbeat {
        /// Reporting node
        node_id: NodeId,
    },
    /// A node's health changed
    StateChanged {
        /// Affected node
        node_id: NodeId,
        /// New health
        health: NodeHealth,
    },
    /// A node left
    Left {
        /// Departed node
        node_id: NodeId,
    },
    /// Leadership moved
    LeaderChanged {
        /// New leader, if any
        leader: Option<NodeId>,
    },
}
