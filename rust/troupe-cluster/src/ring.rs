//! Consistent hash ring

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use troupe_core::{NodeId, ShardKey};

/// Virtual replicas per node unless configured otherwise
pub const DEFAULT_REPLICAS: usize = 64;

/// Consistent hash ring with virtual replicas.
///
/// Each node contributes `replicas` positions `hash(node + "#" + i)`.
/// Owner lookup finds the smallest ring position at or after the
/// shard's hash, wrapping to the first. The ring is immutable after
/// construction; membership changes build a replacement.
#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    ring: Vec<(u64, NodeId)>,
    nodes: Vec<NodeId>,
}

fn position(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

impl HashRing {
    /// Empty ring with the default replica count
    pub fn new() -> Self {
        Self::with_replicas(DEFAULT_REPLICAS)
    }

    /// Empty ring with a custom replica count
    pub fn with_replicas(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            ring: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Build a ring over a node set
    pub fn from_nodes<I, S>(replicas: usize, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let mut ring = Self::with_replicas(replicas);
        ring.set_nodes(nodes);
        ring
    }

    /// Replace the node set, rebuilding every position
    pub fn set_nodes<I, S>(&mut self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let mut unique: Vec<NodeId> = nodes.into_iter().map(Into::into).collect();
        unique.sort();
        unique.dedup();

        let mut ring = Vec::with_capacity(unique.len() * self.replicas);
        for node in &unique {
            for replica in 0..self.replicas {
                ring.push((position(&format!("{}#{}", node, replica)), node.clone()));
            }
        }
        ring.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        self.ring = ring;
        self.nodes = unique;
    }

    /// The node owning a shard, if the ring is non-empty
    pub fn owner(&self, shard: &ShardKey) -> Option<&NodeId> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = position(shard.as_str());
        let idx = self.ring.partition_point(|(pos, _)| *pos < hash);
        let entry = if idx == self.ring.len() {
            &self.ring[0]
        } else {
            &self.ring[idx]
        };
        Some(&entry.1)
    }

    /// Owner assignments for a shard set
    pub fn assignments<'a, I>(&self, shards: I) -> BTreeMap<ShardKey, NodeId>
    where
        I: IntoIterator<Item = &'a ShardKey>,
    {
        shards
            .into_iter()
            .filter_map(|shard| self.owner(shard).map(|node| (shard.clone(), node.clone())))
            .collect()
    }

    /// Nodes currently on the ring, sorted
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Whether the ring has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(key: &str) -> ShardKey {
        ShardKey::new(key)
    }

    #[test]
    fn test_empty_ring_owns_nothing() {
        let ring = HashRing::new();
        assert!(ring.owner(&shard("s1")).is_none());
    }

    #[test]
    fn test_single_node_owns_everything() {
        let ring = HashRing::from_nodes(64, ["node-a"]);
        for key in ["s1", "s2", "s3", "s4"] {
            assert_eq!(ring.owner(&shard(key)), Some(&"node-a".to_string()));
        }
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let a = HashRing::from_nodes(64, ["node-a", "node-b", "node-c"]);
        let b = HashRing::from_nodes(64, ["node-c", "node-a", "node-b"]);
        for i in 0..100 {
            let key = shard(&format!("s{}", i));
            assert_eq!(a.owner(&key), b.owner(&key));
        }
    }

    #[test]
    fn test_node_removal_only_moves_its_shards() {
        let before = HashRing::from_nodes(64, ["node-a", "node-b", "node-c"]);
        let after = HashRing::from_nodes(64, ["node-a", "node-b"]);
        for i in 0..200 {
            let key = shard(&format!("s{}", i));
            let old = before.owner(&key).cloned();
            let new = after.owner(&key).cloned();
            if old.as_deref() != Some("node-c") {
                assert_eq!(old, new, "shard {} moved needlessly", key);
            } else {
                assert_ne!(new.as_deref(), Some("node-c"));
            }
        }
    }

    #[test]
    fn test_distribution_roughly_even() {
        let ring = HashRing::from_nodes(64, ["node-a", "node-b", "node-c", "node-d"]);
        let mut counts: BTreeMap<NodeId, usize> = BTreeMap::new();
        for i in 0..1000 {
            let key = shard(&format!("wf-{}", i));
            let owner = ring.owner(&key).cloned().unwrap();
            *counts.entry(owner).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 4);
        for (_, count) in counts {
            // 1000 shards over 4 nodes; virtual replicas keep any node
            // from hoarding or starving by an order of magnitude.
            assert!(count > 100 && count < 500);
        }
    }
}
