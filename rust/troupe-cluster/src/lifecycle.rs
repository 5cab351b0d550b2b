//! Node heartbeat lifecycle

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use troupe_core::{CancelCause, CancelToken};

use crate::coordinator::Coordinator;
use crate::error::{CoordinationError, CoordinationResult};
use crate::types::{LeaseId, NodeHealth, NodeRegistration};

/// Heartbeat loop configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Membership lease TTL presented on join and heartbeat
    pub ttl: Duration,
    /// Interval between heartbeats; must be smaller than `ttl`
    pub heartbeat_interval: Duration,
    /// Consecutive failures before local health turns unhealthy
    pub failure_threshold: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

impl LifecycleConfig {
    /// Reject configurations whose heartbeat cannot keep the lease
    pub fn validate(&self) -> CoordinationResult<()> {
        if self.heartbeat_interval >= self.ttl {
            return Err(CoordinationError::Backend(
                "heartbeat_interval must be smaller than ttl".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(CoordinationError::Backend(
                "failure_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Joins the cluster and keeps the membership lease alive.
///
/// Transitions local health healthy / unhealthy / leaving; a
/// successful heartbeat recovers immediately, an expired or lost lease
/// triggers a rejoin.
pub struct NodeLifecycle {
    coordinator: Arc<dyn Coordinator>,
    registration: NodeRegistration,
    lease: Arc<Mutex<LeaseId>>,
    health_tx: watch::Sender<NodeHealth>,
    shutdown: CancelToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl NodeLifecycle {
    /// Join and start the heartbeat loop
    pub async fn start(
        coordinator: Arc<dyn Coordinator>,
        registration: NodeRegistration,
        config: LifecycleConfig,
    ) -> CoordinationResult<Arc<Self>> {
        config.validate()?;
        let node = coordinator
            .join(registration.clone(), config.ttl)
            .await?;
        let (health_tx, _) = watch::channel(NodeHealth::Healthy);
        let lifecycle = Arc::new(Self {
            coordinator,
            registration,
            lease: Arc::new(Mutex::new(node.lease_id)),
            health_tx,
            shutdown: CancelToken::new(),
            handle: Mutex::new(None),
        });

        let looped = lifecycle.clone();
        let handle = tokio::spawn(async move {
            looped.heartbeat_loop(config).await;
        });
        *lifecycle.handle.lock() = Some(handle);
        Ok(lifecycle)
    }

    /// The node's current membership lease
    pub fn lease_id(&self) -> LeaseId {
        *self.lease.lock()
    }

    /// The node identifier this lifecycle manages
    pub fn node_id(&self) -> &str {
        &self.registration.node_id
    }

    /// Current locally tracked health
    pub fn health(&self) -> NodeHealth {
        *self.health_tx.borrow()
    }

    /// Subscribe to local health transitions
    pub fn watch_health(&self) -> watch::Receiver<NodeHealth> {
        self.health_tx.subscribe()
    }

    async fn heartbeat_loop(&self, config: LifecycleConfig) {
        let mut consecutive_failures: u32 = 0;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(config.heartbeat_interval) => {}
            }

            let lease = self.lease_id();
            match self
                .coordinator
                .heartbeat(&self.registration.node_id, &lease, config.ttl)
                .await
            {
                Ok(_) => {
                    consecutive_failures = 0;
                    // Recovery on a successful heartbeat is immediate.
                    self.set_health(NodeHealth::Healthy);
                }
                Err(CoordinationError::LeaseExpired(_))
                | Err(CoordinationError::NodeNotFound(_))
                | Err(CoordinationError::LeaseMismatch(_)) => {
                    tracing::warn!(
                        node = %self.registration.node_id,
                        "membership lease lost, rejoining"
                    );
                    match self
                        .coordinator
                        .join(self.registration.clone(), config.ttl)
                        .await
                    {
                        Ok(node) => {
                            *self.lease.lock() = node.lease_id;
                            consecutive_failures = 0;
                            self.set_health(NodeHealth::Healthy);
                        }
                        Err(err) => {
                            consecutive_failures += 1;
                            tracing::warn!(
                                node = %self.registration.node_id,
                                error = %err,
                                "rejoin failed"
                            );
                            if consecutive_failures >= config.failure_threshold {
                                self.set_health(NodeHealth::Unhealthy);
                            }
                        }
                    }
                }
                Err(err) => {
                    consecutive_failures += 1;
                    tracing::debug!(
                        node = %self.registration.node_id,
                        error = %err,
                        failures = consecutive_failures,
                        "heartbeat failed"
                    );
                    if consecutive_failures >= config.failure_threshold {
                        self.set_health(NodeHealth::Unhealthy);
                    }
                }
            }
        }
    }

    fn set_health(&self, health: NodeHealth) {
        self.health_tx.send_if_modified(|current| {
            if *current != health {
                *current = health;
                true
            } else {
                false
            }
        });
    }

    /// Stop the loop and leave the cluster
    pub async fn stop(&self) {
        self.set_health(NodeHealth::Leaving);
        self.shutdown.cancel(CancelCause::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.await;
        }
        let lease = self.lease_id();
        if let Err(err) = self
            .coordinator
            .leave(&self.registration.node_id, &lease)
            .await
        {
            tracing::debug!(
                node = %self.registration.node_id,
                error = %err,
                "leave failed during shutdown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryCoordinator;

    fn fast_config() -> LifecycleConfig {
        LifecycleConfig {
            ttl: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(40),
            failure_threshold: 2,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_keeps_node_listed() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let lifecycle = NodeLifecycle::start(
            coordinator.clone(),
            NodeRegistration::new("node-a", "node-a:7000"),
            fast_config(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let nodes = coordinator.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(lifecycle.health(), NodeHealth::Healthy);

        lifecycle.stop().await;
        assert!(coordinator.list_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let result = NodeLifecycle::start(
            coordinator,
            NodeRegistration::new("node-a", "node-a:7000"),
            LifecycleConfig {
                ttl: Duration::from_secs(1),
                heartbeat_interval: Duration::from_secs(2),
                failure_threshold: 1,
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_lease_loss_triggers_rejoin() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let lifecycle = NodeLifecycle::start(
            coordinator.clone(),
            NodeRegistration::new("node-a", "node-a:7000"),
            fast_config(),
        )
        .await
        .unwrap();
        let original_lease = lifecycle.lease_id();

        // Evict the node behind the lifecycle's back.
        coordinator.leave("node-a", &original_lease).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The loop rejoined with a fresh lease.
        assert_eq!(coordinator.list_nodes().await.unwrap().len(), 1);
        assert_ne!(lifecycle.lease_id(), original_lease);
        lifecycle.stop().await;
    }
}
