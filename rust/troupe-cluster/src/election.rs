//! Leader election loop

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use troupe_core::{CancelCause, CancelToken};

use crate::coordinator::Coordinator;
use crate::error::CoordinationResult;
use crate::types::LeaderLease;

/// Election loop configuration
#[derive(Debug, Clone)]
pub struct ElectorConfig {
    /// Leader lease TTL
    pub lease_ttl: Duration,
    /// Acquisition retry interval while follower
    pub retry_interval: Duration,
    /// Renewal interval while leader; must stay well under the TTL
    pub renew_interval: Duration,
}

impl Default for ElectorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(15),
            retry_interval: Duration::from_secs(3),
            renew_interval: Duration::from_secs(5),
        }
    }
}

/// Per-node elector: acquire while follower, renew while leader,
/// demote immediately on a failed renewal.
pub struct LeaderElector {
    coordinator: Arc<dyn Coordinator>,
    node_id: String,
    config: ElectorConfig,
    lease: Mutex<Option<LeaderLease>>,
    leadership_tx: watch::Sender<bool>,
    shutdown: CancelToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElector {
    /// Start the election loop for a node
    pub fn start(
        coordinator: Arc<dyn Coordinator>,
        node_id: impl Into<String>,
        config: ElectorConfig,
    ) -> Arc<Self> {
        let (leadership_tx, _) = watch::channel(false);
        let elector = Arc::new(Self {
            coordinator,
            node_id: node_id.into(),
            config,
            lease: Mutex::new(None),
            leadership_tx,
            shutdown: CancelToken::new(),
            handle: Mutex::new(None),
        });
        let looped = elector.clone();
        let handle = tokio::spawn(async move {
            looped.election_loop().await;
        });
        *elector.handle.lock() = Some(handle);
        elector
    }

    /// Whether this node currently holds the leader lease
    pub fn is_leader(&self) -> bool {
        *self.leadership_tx.borrow()
    }

    /// Subscribe to leadership transitions (best-effort, latest value)
    pub fn watch_leadership(&self) -> watch::Receiver<bool> {
        self.leadership_tx.subscribe()
    }

    async fn election_loop(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            if self.is_leader() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.config.renew_interval) => {}
                }
                if let Err(err) = self.renew().await {
                    tracing::warn!(node = %self.node_id, error = %err, "leader renewal failed, demoting");
                    self.demote();
                }
            } else {
                match self
                    .coordinator
                    .acquire_leader_lease(&self.node_id, self.config.lease_ttl)
                    .await
                {
                    Ok(lease) => {
                        tracing::info!(node = %self.node_id, "became leader");
                        *self.lease.lock() = Some(lease);
                        let _ = self.leadership_tx.send(true);
                    }
                    Err(err) => {
                        tracing::trace!(node = %self.node_id, error = %err, "leader acquisition failed");
                        // Jitter the retry so peers do not stampede.
                        let cap = (self.config.retry_interval / 4).max(Duration::from_millis(1));
                        let jitter = rand::thread_rng().gen_range(Duration::ZERO..cap);
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return,
                            _ = tokio::time::sleep(self.config.retry_interval + jitter) => {}
                        }
                    }
                }
            }
        }
    }

    async fn renew(&self) -> CoordinationResult<()> {
        let lease = self.lease.lock().clone();
        let Some(lease) = lease else {
            return Ok(());
        };
        let renewed = self
            .coordinator
            .renew_leader_lease(&self.node_id, &lease.lease_id, self.config.lease_ttl)
            .await?;
        *self.lease.lock() = Some(renewed);
        Ok(())
    }

    fn demote(&self) {
        *self.lease.lock() = None;
        let _ = self.leadership_tx.send(false);
    }

    /// Stop the loop, releasing the lease if held
    pub async fn stop(&self) {
        self.shutdown.cancel(CancelCause::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.await;
        }
        let lease = self.lease.lock().take();
        if let Some(lease) = lease {
            let _ = self
                .coordinator
                .release_leader_lease(&self.node_id, &lease.lease_id)
                .await;
        }
        let _ = self.leadership_tx.send(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryCoordinator;

    fn fast_config() -> ElectorConfig {
        ElectorConfig {
            lease_ttl: Duration::from_millis(300),
            retry_interval: Duration::from_millis(40),
            renew_interval: Duration::from_millis(60),
        }
    }

    #[tokio::test]
    async fn test_single_elector_becomes_leader() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let elector = LeaderElector::start(coordinator, "node-a", fast_config());
        let mut watch = elector.watch_leadership();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !*watch.borrow_and_update() {
                watch.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(elector.is_leader());
        elector.stop().await;
    }

    #[tokio::test]
    async fn test_only_one_of_two_electors_leads() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let a = LeaderElector::start(coordinator.clone(), "node-a", fast_config());
        let b = LeaderElector::start(coordinator.clone(), "node-b", fast_config());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(a.is_leader() ^ b.is_leader());
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_release_hands_leadership_over() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let a = LeaderElector::start(coordinator.clone(), "node-a", fast_config());
        let mut watch_a = a.watch_leadership();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !*watch_a.borrow_and_update() {
                watch_a.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let b = LeaderElector::start(coordinator.clone(), "node-b", fast_config());
        a.stop().await;

        let mut watch_b = b.watch_leadership();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !*watch_b.borrow_and_update() {
                watch_b.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(b.is_leader());
        b.stop().await;
    }
}
