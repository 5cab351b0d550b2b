//! Lane configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LaneError, LaneResult};

/// Reaction when a lane is at capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum BackpressurePolicy {
    /// `submit` waits for capacity; `try_submit` rejects
    Block,
    /// Both calls reject immediately
    Drop,
    /// Forward to a named fallback lane and report success
    Redirect {
        /// Fallback lane name; cycles are rejected at build time
        to: String,
    },
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::Block
    }
}

/// Token-bucket rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained admissions per second
    pub rate_per_sec: u32,
    /// Burst allowance
    pub burst: u32,
}

/// Behavior when the Redis substrate is unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradedMode {
    /// Reject admissions while degraded
    FailFast,
    /// Fall back to an in-memory local lane
    Fallback,
}

impl Default for DegradedMode {
    fn default() -> Self {
        DegradedMode::Fallback
    }
}

/// Which substrate backs a lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneBackend {
    /// In-memory queue and workers
    Local,
    /// Redis list / sorted set
    Redis,
}

impl Default for LaneBackend {
    fn default() -> Self {
        LaneBackend::Local
    }
}

/// Per-lane configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Bound on queued + in-flight tasks
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Backpressure policy at the capacity bound
    #[serde(default)]
    pub policy: BackpressurePolicy,
    /// Order by priority instead of FIFO
    #[serde(default)]
    pub priority: bool,
    /// Worker loops executing dequeued tasks
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Optional token-bucket admission limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    /// Substrate selection
    #[serde(default)]
    pub backend: LaneBackend,
    /// Deduplication key lifetime on the Redis substrate
    #[serde(default = "default_dedup_ttl_ms")]
    pub dedup_ttl_ms: u64,
    /// Reaction to a sustained substrate outage
    #[serde(default)]
    pub degraded_mode: DegradedMode,
    /// Outage duration after which the promotion buffer drains into
    /// the fallback lane
    #[serde(default = "default_degrade_after_ms")]
    pub degrade_after_ms: u64,
}

fn default_capacity() -> usize {
    1024
}

fn default_workers() -> usize {
    4
}

fn default_dedup_ttl_ms() -> u64 {
    10 * 60 * 1000
}

fn default_degrade_after_ms() -> u64 {
    30 * 1000
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            policy: BackpressurePolicy::default(),
            priority: false,
            workers: default_workers(),
            rate_limit: None,
            backend: LaneBackend::default(),
            dedup_ttl_ms: default_dedup_ttl_ms(),
            degraded_mode: DegradedMode::default(),
            degrade_after_ms: default_degrade_after_ms(),
        }
    }
}

impl LaneConfig {
    /// Validate a single lane's configuration
    pub fn validate(&self, name: &str) -> LaneResult<()> {
        if let Some(rate) = &self.rate_limit {
            if rate.rate_per_sec == 0 {
                return Err(LaneError::Config(format!(
                    "lane {}: rate_per_sec must be positive",
                    name
                )));
            }
            if rate.burst == 0 {
                return Err(LaneError::Config(format!(
                    "lane {}: burst must be positive",
                    name
                )));
            }
        }
        if let BackpressurePolicy::Redirect { to } = &self.policy {
            if to == name {
                return Err(LaneError::Config(format!(
                    "lane {}: redirect target is the lane itself",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Deduplication TTL as a duration
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    /// Degrade threshold as a duration
    pub fn degrade_after(&self) -> Duration {
        Duration::from_millis(self.degrade_after_ms)
    }
}
