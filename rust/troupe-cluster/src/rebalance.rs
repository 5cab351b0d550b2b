//! Rebalance planning

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use troupe_core::{NodeId, ShardKey};

use crate::ring::HashRing;
use crate::types::{NodeHealth, NodeState};

/// Why a shard is moving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferReason {
    /// A node joined the ring
    NodeJoin,
    /// A node left gracefully
    NodeLeave,
    /// A node was removed as unhealthy
    NodeFailure,
}

impl std::fmt::Display for TransferReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferReason::NodeJoin => write!(f, "node-join"),
            TransferReason::NodeLeave => write!(f, "node-leave"),
            TransferReason::NodeFailure => write!(f, "node-failure"),
        }
    }
}

/// One planned shard movement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTransfer {
    /// Moving shard
    pub shard: ShardKey,
    /// Previous owner, absent for newly assigned shards
    pub from: Option<NodeId>,
    /// New owner
    pub to: NodeId,
    /// Trigger
    pub reason: TransferReason,
}

/// Diff two assignment maps into a deterministic transfer list.
///
/// Emits one entry per shard whose owner changed and whose new owner
/// is non-empty, sorted by shard key.
pub fn plan_rebalance(
    previous: &BTreeMap<ShardKey, NodeId>,
    current: &BTreeMap<ShardKey, NodeId>,
    reason: TransferReason,
) -> Vec<ShardTransfer> {
    let mut transfers = Vec::new();
    for (shard, owner) in current {
        let prior = previous.get(shard);
        if prior.map(|node| node == owner).unwrap_or(false) {
            continue;
        }
        transfers.push(ShardTransfer {
            shard: shard.clone(),
            from: prior.cloned(),
            to: owner.clone(),
            reason,
        });
    }
    // BTreeMap iteration already sorts by shard key.
    transfers
}

/// Membership-driven planner with debounce.
///
/// Runs on every membership event; calls inside the configured
/// interval after a run return `None` so storms of events collapse
/// into one plan.
pub struct RebalancePlanner {
    replicas: usize,
    min_interval: Duration,
    last_run: Mutex<Option<Instant>>,
    previous: Mutex<BTreeMap<ShardKey, NodeId>>,
}

impl RebalancePlanner {
    /// Planner with the given ring replica count and debounce interval
    pub fn new(replicas: usize, min_interval: Duration) -> Self {
        Self {
            replicas,
            min_interval,
            last_run: Mutex::new(None),
            previous: Mutex::new(BTreeMap::new()),
        }
    }

    /// Plan transfers for the current membership, or `None` while
    /// debounced.
    ///
    /// Nodes are filtered by health before the ring is built: only
    /// healthy nodes take assignments.
    pub fn plan_for_membership(
        &self,
        nodes: &[NodeState],
        shards: &[ShardKey],
        reason: TransferReason,
    ) -> Option<Vec<ShardTransfer>> {
        {
            let mut last_run = self.last_run.lock();
            if let Some(at) = *last_run {
                if at.elapsed() < self.min_interval {
                    return None;
                }
            }
            *last_run = Some(Instant::now());
        }

        let healthy: Vec<NodeId> = nodes
            .iter()
            .filter(|node| node.health == NodeHealth::Healthy)
            .map(|node| node.node_id.clone())
            .collect();
        let ring = HashRing::from_nodes(self.replicas, healthy);
        let current = ring.assignments(shards.iter());

        let mut previous = self.previous.lock();
        let transfers = plan_rebalance(&previous, &current, reason);
        *previous = current;
        Some(transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::types::LeaseId;

    fn assignments(entries: &[(&str, &str)]) -> BTreeMap<ShardKey, NodeId> {
        entries
            .iter()
            .map(|(shard, node)| (ShardKey::new(*shard), node.to_string()))
            .collect()
    }

    fn node(id: &str, health: NodeHealth) -> NodeState {
        NodeState {
            node_id: id.to_string(),
            address: format!("{}:7000", id),
            metadata: Default::default(),
            health,
            lease_id: LeaseId::new(),
            last_heartbeat: Utc::now(),
            lease_expires_at: Utc::now() + chrono::Duration::seconds(30),
        }
    }

    #[test]
    fn test_plan_emits_only_changed_shards() {
        let previous = assignments(&[("s1", "a"), ("s2", "a"), ("s3", "b")]);
        let current = assignments(&[("s1", "a"), ("s2", "b"), ("s3", "b")]);
        let plan = plan_rebalance(&previous, &current, TransferReason::NodeJoin);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].shard, ShardKey::new("s2"));
        assert_eq!(plan[0].from.as_deref(), Some("a"));
        assert_eq!(plan[0].to, "b");
    }

    #[test]
    fn test_plan_includes_fresh_assignments() {
        let previous = BTreeMap::new();
        let current = assignments(&[("s1", "a")]);
        let plan = plan_rebalance(&previous, &current, TransferReason::NodeJoin);
        assert_eq!(plan.len(), 1);
        assert!(plan[0].from.is_none());
    }

    #[test]
    fn test_plan_is_sorted_by_shard() {
        let previous = BTreeMap::new();
        let current = assignments(&[("s3", "a"), ("s1", "a"), ("s2", "a")]);
        let plan = plan_rebalance(&previous, &current, TransferReason::NodeJoin);
        let shards: Vec<&str> = plan.iter().map(|t| t.shard.as_str()).collect();
        assert_eq!(shards, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn test_unhealthy_nodes_take_no_assignments() {
        let planner = RebalancePlanner::new(16, Duration::ZERO);
        let shards: Vec<ShardKey> = (0..50).map(|i| ShardKey::new(format!("s{}", i))).collect();
        let plan = planner
            .plan_for_membership(
                &[node("a", NodeHealth::Healthy), node("b", NodeHealth::Unhealthy)],
                &shards,
                TransferReason::NodeFailure,
            )
            .unwrap();
        assert!(plan.iter().all(|t| t.to == "a"));
    }

    #[test]
    fn test_debounce_suppresses_rapid_runs() {
        let planner = RebalancePlanner::new(16, Duration::from_secs(60));
        let shards = vec![ShardKey::new("s1")];
        let members = vec![node("a", NodeHealth::Healthy)];
        assert!(planner
            .plan_for_membership(&members, &shards, TransferReason::NodeJoin)
            .is_some());
        assert!(planner
            .plan_for_membership(&members, &shards, TransferReason::NodeJoin)
            .is_none());
    }
}
