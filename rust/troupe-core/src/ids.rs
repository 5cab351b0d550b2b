//! Identifiers shared across the engine

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Node identifier within a cluster.
///
/// Plain strings: deployments use hostnames, pod names, or operator
/// supplied ids, and the coordinator treats them as opaque.
pub type NodeId = String;

/// Unique identifier for a submitted workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Generate a new workflow ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partition key mapping a workflow (or other partitionable entity)
/// onto the consistent-hash ring.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardKey(String);

impl ShardKey {
    /// Wrap a raw shard key string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ShardKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Derive the shard key for a workflow.
///
/// Deterministic across nodes: every node must agree on which shard a
/// workflow belongs to without talking to each other.
pub fn shard_for_workflow(workflow_id: &WorkflowId) -> ShardKey {
    let digest = Sha256::digest(workflow_id.to_string().as_bytes());
    ShardKey(format!("wf-{}", hex::encode(&digest[..8])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_id_roundtrip() {
        let id = WorkflowId::new();
        let parsed = WorkflowId::parse_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_shard_key_deterministic() {
        let id = WorkflowId::new();
        assert_eq!(shard_for_workflow(&id), shard_for_workflow(&id));
    }

    #[test]
    fn test_shard_keys_differ_across_workflows() {
        let a = shard_for_workflow(&WorkflowId::new());
        let b = shard_for_workflow(&WorkflowId::new());
        assert_ne!(a, b);
    }
}
