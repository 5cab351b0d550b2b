//! Node configuration
//!
//! Layered loading: built-in defaults, then an optional TOML file,
//! then `TROUPE_*` environment variables. Validation runs after the
//! merge so a bad override fails at startup, not mid-flight.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use troupe_lanes::LaneConfig;

use crate::error::{EngineError, EngineResult};

/// Node identity and address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSection {
    /// Node identifier within the cluster
    pub id: String,
    /// Advertised address
    pub address: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: "node-1".to_string(),
            address: "127.0.0.1:7400".to_string(),
        }
    }
}

/// Engine tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Bound on concurrently executing workflows
    pub max_concurrent_workflows: usize,
    /// Per-task signal buffer size
    pub signal_buffer: usize,
    /// Timeout in milliseconds applied to tasks that declare none;
    /// zero disables the default
    pub default_task_timeout_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 16,
            signal_buffer: 16,
            default_task_timeout_ms: 0,
        }
    }
}

/// Redis substrate settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisSection {
    /// Connection URL
    pub url: String,
    /// Keyspace prefix
    pub key_prefix: String,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            key_prefix: "troupe".to_string(),
        }
    }
}

/// Cluster coordination settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationSection {
    /// Membership lease TTL in milliseconds
    pub ttl_ms: u64,
    /// Heartbeat interval in milliseconds; must stay under `ttl_ms`
    pub heartbeat_interval_ms: u64,
    /// Consecutive heartbeat failures before local health degrades
    pub failure_threshold: u32,
    /// Leader lease TTL in milliseconds
    pub leader_ttl_ms: u64,
    /// Leader acquisition retry interval in milliseconds
    pub retry_interval_ms: u64,
    /// Leader renewal interval in milliseconds
    pub renew_interval_ms: u64,
    /// Virtual replicas per node on the hash ring
    pub ring_replicas: usize,
    /// Debounce floor between rebalance planner runs, milliseconds
    pub min_rebalance_interval_ms: u64,
}

impl Default for CoordinationSection {
    fn default() -> Self {
        Self {
            ttl_ms: 15_000,
            heartbeat_interval_ms: 5_000,
            failure_threshold: 3,
            leader_ttl_ms: 15_000,
            retry_interval_ms: 3_000,
            renew_interval_ms: 5_000,
            ring_replicas: 64,
            min_rebalance_interval_ms: 5_000,
        }
    }
}

/// Full node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TroupeConfig {
    /// Node identity
    pub node: NodeSection,
    /// Engine tunables
    pub engine: EngineSection,
    /// Redis substrate; absent means purely local operation
    pub redis: Option<RedisSection>,
    /// Cluster coordination loops
    pub coordination: CoordinationSection,
    /// Lane definitions by name
    pub lanes: BTreeMap<String, LaneConfig>,
}

impl TroupeConfig {
    /// Load defaults, an optional file, and `TROUPE_*` environment
    /// overrides (e.g. `TROUPE_NODE__ID=node-2`).
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix("TROUPE").separator("__"));
        let merged: TroupeConfig = builder
            .build()
            .map_err(|err| EngineError::Config(err.to_string()))?
            .try_deserialize()
            .map_err(|err| EngineError::Config(err.to_string()))?;
        merged.validate()?;
        Ok(merged)
    }

    /// Reject configurations that cannot run
    pub fn validate(&self) -> EngineResult<()> {
        if self.node.id.trim().is_empty() {
            return Err(EngineError::Config("node.id must not be empty".to_string()));
        }
        if self.engine.max_concurrent_workflows == 0 {
            return Err(EngineError::Config(
                "engine.max_concurrent_workflows must be positive".to_string(),
            ));
        }
        if self.coordination.heartbeat_interval_ms >= self.coordination.ttl_ms {
            return Err(EngineError::Config(
                "coordination.heartbeat_interval_ms must be smaller than ttl_ms".to_string(),
            ));
        }
        if self.coordination.ring_replicas == 0 {
            return Err(EngineError::Config(
                "coordination.ring_replicas must be positive".to_string(),
            ));
        }
        for (name, lane) in &self.lanes {
            lane.validate(name)
                .map_err(|err| EngineError::Config(err.to_string()))?;
        }
        Ok(())
    }

    /// Default timeout as a duration, if enabled
    pub fn default_task_timeout(&self) -> Option<Duration> {
        if self.engine.default_task_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.engine.default_task_timeout_ms))
        }
    }
}
