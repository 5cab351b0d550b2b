//! Named lane registry

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;

use troupe_core::{CancelToken, MetricsRecorder, NoopMetrics, OwnershipResolver};

use crate::config::{BackpressurePolicy, DegradedMode, LaneBackend, LaneConfig};
use crate::error::{LaneError, LaneResult};
use crate::local::LocalLane;
use crate::redis_lane::{RedisLane, RedisLaneSettings};
use crate::runner::TaskRunner;
use crate::task::LaneTask;
use crate::{Lane, LaneStats, SubmitOutcome};

/// Builds a [`LaneManager`] from per-lane configuration
///
/// Validation happens here: every redirect target must exist, redirect
/// chains must be acyclic, and Redis-backed lanes require connection
/// settings.
pub struct LaneManagerBuilder {
    runner: Arc<dyn TaskRunner>,
    metrics: Arc<dyn MetricsRecorder>,
    redis: Option<RedisLaneSettings>,
    resolver: Option<Arc<dyn OwnershipResolver>>,
    configs: BTreeMap<String, LaneConfig>,
}

impl LaneManagerBuilder {
    /// Start a builder around the engine's task runner
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            runner,
            metrics: Arc::new(NoopMetrics),
            redis: None,
            resolver: None,
            configs: BTreeMap::new(),
        }
    }

    /// Inject a metrics recorder
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Enable the Redis substrate for lanes configured with it
    pub fn with_redis(mut self, settings: RedisLaneSettings) -> Self {
        self.redis = Some(settings);
        self
    }

    /// Enable distributed ownership enforcement on Redis lanes
    pub fn with_resolver(mut self, resolver: Arc<dyn OwnershipResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Register a lane
    pub fn lane(mut self, name: impl Into<String>, config: LaneConfig) -> Self {
        self.configs.insert(name.into(), config);
        self
    }

    /// Validate the whole configuration and construct every lane
    pub fn build(self) -> LaneResult<LaneManager> {
        for (name, config) in &self.configs {
            config.validate(name)?;
        }
        self.validate_redirects()?;

        let lanes: DashMap<String, Arc<dyn Lane>> = DashMap::new();
        let mut locals: BTreeMap<String, Arc<LocalLane>> = BTreeMap::new();

        for (name, config) in &self.configs {
            match config.backend {
                LaneBackend::Local => {
                    let lane = LocalLane::new(
                        name.clone(),
                        config.clone(),
                        self.runner.clone(),
                        self.metrics.clone(),
                    )?;
                    locals.insert(name.clone(), lane.clone());
                    lanes.insert(name.clone(), lane);
                }
                LaneBackend::Redis => {
                    let settings = self.redis.clone().ok_or_else(|| {
                        LaneError::Config(format!(
                            "lane {}: redis backend selected but no redis settings provided",
                            name
                        ))
                    })?;
                    let fallback = match config.degraded_mode {
                        DegradedMode::Fallback => Some(LocalLane::new(
                            format!("{}-fallback", name),
                            LaneConfig {
                                backend: LaneBackend::Local,
                                policy: BackpressurePolicy::Block,
                                ..config.clone()
                            },
                            self.runner.clone(),
                            self.metrics.clone(),
                        )?),
                        DegradedMode::FailFast => None,
                    };
                    let lane = RedisLane::new(
                        name.clone(),
                        config.clone(),
                        settings,
                        self.runner.clone(),
                        self.metrics.clone(),
                        self.resolver.clone(),
                        fallback,
                    )?;
                    lanes.insert(name.clone(), lane);
                }
            }
        }

        // Wire in-memory redirect targets now that every lane exists.
        for (name, config) in &self.configs {
            if let BackpressurePolicy::Redirect { to } = &config.policy {
                if let Some(local) = locals.get(name) {
                    let target = lanes
                        .get(to)
                        .map(|entry| entry.value().clone())
                        .ok_or_else(|| LaneError::NotFound(to.clone()))?;
                    local.set_redirect_target(target);
                }
            }
        }

        Ok(LaneManager { lanes })
    }

    /// Every redirect target must exist and chains must terminate.
    fn validate_redirects(&self) -> LaneResult<()> {
        for (name, config) in &self.configs {
            let BackpressurePolicy::Redirect { to } = &config.policy else {
                continue;
            };
            if !self.configs.contains_key(to) {
                return Err(LaneError::Config(format!(
                    "lane {}: redirect target {} does not exist",
                    name, to
                )));
            }
            let mut visited: HashSet<&str> = HashSet::new();
            visited.insert(name.as_str());
            let mut cursor = to.as_str();
            loop {
                if !visited.insert(cursor) {
                    return Err(LaneError::Config(format!(
                        "redirect cycle involving lane {}",
                        name
                    )));
                }
                match self.configs.get(cursor).map(|c| &c.policy) {
                    Some(BackpressurePolicy::Redirect { to }) => cursor = to.as_str(),
                    _ => break,
                }
            }
        }
        Ok(())
    }
}

/// Maps lane names to lane instances and routes submissions
pub struct LaneManager {
    lanes: DashMap<String, Arc<dyn Lane>>,
}

impl LaneManager {
    /// Look up a lane by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Lane>> {
        self.lanes.get(name).map(|entry| entry.value().clone())
    }

    /// Registered lane names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lanes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Submit into the named lane, honoring its backpressure policy
    pub async fn submit(
        &self,
        ctx: &CancelToken,
        lane: &str,
        task: LaneTask,
    ) -> LaneResult<SubmitOutcome> {
        let lane = self
            .get(lane)
            .ok_or_else(|| LaneError::NotFound(lane.to_string()))?;
        lane.submit(ctx, task).await
    }

    /// Non-blocking submit into the named lane
    pub async fn try_submit(&self, lane: &str, task: LaneTask) -> LaneResult<SubmitOutcome> {
        let lane = self
            .get(lane)
            .ok_or_else(|| LaneError::NotFound(lane.to_string()))?;
        lane.try_submit(task).await
    }

    /// Remove a queued task wherever it sits
    ///
    /// Returns the removing lane's name and the envelope.
    pub async fn cancel_queued(&self, task_id: &str) -> Option<(String, LaneTask)> {
        let lanes: Vec<(String, Arc<dyn Lane>)> = self
            .lanes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (name, lane) in lanes {
            if let Some(task) = lane.cancel_queued(task_id).await {
                return Some((name, task));
            }
        }
        None
    }

    /// Snapshot statistics for every lane, sorted by name
    pub async fn stats(&self) -> Vec<LaneStats> {
        let lanes: Vec<Arc<dyn Lane>> = self.lanes.iter().map(|e| e.value().clone()).collect();
        let mut stats = Vec::with_capacity(lanes.len());
        for lane in lanes {
            stats.push(lane.stats().await);
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Close every lane
    pub async fn close(&self) {
        let lanes: Vec<Arc<dyn Lane>> = self.lanes.iter().map(|e| e.value().clone()).collect();
        for lane in lanes {
            lane.close().await;
        }
        tracing::info!("all lanes closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::FnRunner;
    use troupe_core::{TaskContext, TaskOutcome, WorkflowId};

    fn runner() -> Arc<dyn TaskRunner> {
        Arc::new(FnRunner::new(|ctx: TaskContext| async move {
            TaskOutcome::completed(ctx.workflow_id, ctx.task_id.clone(), serde_json::json!(null))
        }))
    }

    fn task(id: &str) -> LaneTask {
        LaneTask::new(WorkflowId::new(), id, serde_json::Value::Null)
    }

    #[tokio::test]
    async fn test_unknown_lane_is_not_found() {
        let manager = LaneManagerBuilder::new(runner())
            .lane(
                "cpu",
                LaneConfig {
                    workers: 0,
                    ..Default::default()
                },
            )
            .build()
            .unwrap();
        let ctx = CancelToken::new();
        let err = manager.submit(&ctx, "gpu", task("a")).await.unwrap_err();
        assert!(matches!(err, LaneError::NotFound(_)));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_routes_by_lane_name() {
        let manager = LaneManagerBuilder::new(runner())
            .lane(
                "cpu",
                LaneConfig {
                    workers: 0,
                    ..Default::default()
                },
            )
            .lane(
                "io",
                LaneConfig {
                    workers: 0,
                    ..Default::default()
                },
            )
            .build()
            .unwrap();
        let ctx = CancelToken::new();
        manager.submit(&ctx, "io", task("a")).await.unwrap();
        let stats = manager.stats().await;
        let io = stats.iter().find(|s| s.name == "io").unwrap();
        let cpu = stats.iter().find(|s| s.name == "cpu").unwrap();
        assert_eq!(io.depth, 1);
        assert_eq!(cpu.depth, 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_redirect_cycle_rejected_at_build() {
        let result = LaneManagerBuilder::new(runner())
            .lane(
                "a",
                LaneConfig {
                    workers: 0,
                    policy: BackpressurePolicy::Redirect { to: "b".to_string() },
                    ..Default::default()
                },
            )
            .lane(
                "b",
                LaneConfig {
                    workers: 0,
                    policy: BackpressurePolicy::Redirect { to: "a".to_string() },
                    ..Default::default()
                },
            )
            .build();
        assert!(matches!(result, Err(LaneError::Config(_))));
    }

    #[tokio::test]
    async fn test_redirect_to_missing_lane_rejected() {
        let result = LaneManagerBuilder::new(runner())
            .lane(
                "a",
                LaneConfig {
                    workers: 0,
                    policy: BackpressurePolicy::Redirect { to: "ghost".to_string() },
                    ..Default::default()
                },
            )
            .build();
        assert!(matches!(result, Err(LaneError::Config(_))));
    }

    #[tokio::test]
    async fn test_redis_backend_requires_settings() {
        let result = LaneManagerBuilder::new(runner())
            .lane(
                "io",
                LaneConfig {
                    workers: 0,
                    backend: LaneBackend::Redis,
                    ..Default::default()
                },
            )
            .build();
        assert!(matches!(result, Err(LaneError::Config(_))));
    }

    #[tokio::test]
    async fn test_cancel_queued_searches_lanes() {
        let manager = LaneManagerBuilder::new(runner())
            .lane(
                "cpu",
                LaneConfig {
                    workers: 0,
                    ..Default::default()
                },
            )
            .build()
            .unwrap();
        let ctx = CancelToken::new();
        manager.submit(&ctx, "cpu", task("t1")).await.unwrap();
        let removed = manager.cancel_queued("t1").await;
        assert_eq!(removed.map(|(lane, t)| (lane, t.task_id)),
                   Some(("cpu".to_string(), "t1".to_string())));
        manager.close().await;
    }
}
