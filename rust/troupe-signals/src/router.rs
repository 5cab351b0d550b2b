//! Distributed routing bridge
//!
//! Wraps a local bus with an ownership resolver and a remote
//! publisher: signals for locally owned tasks go to the local bus,
//! everything else is forwarded to the owner node. A sliding window of
//! recently routed fingerprints suppresses duplicates.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;

use troupe_core::{NodeId, OwnershipResolver, ResolveError};

use crate::bus::SignalBus;
use crate::error::{SignalError, SignalResult};
use crate::ring::SignalReceiver;
use crate::signal::Signal;

/// Duplicate suppression horizon
pub const DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// Fingerprints tracked before the oldest entries age out by capacity
const WINDOW_CAPACITY: usize = 8192;

/// Delivers a signal to another node's bus
#[async_trait]
pub trait RemotePublisher: Send + Sync {
    /// Publish `signal` on the bus owned by `node`
    async fn publish_remote(&self, node: &NodeId, signal: Signal) -> SignalResult<()>;
}

/// In-process remote publisher: node id to bus instance.
///
/// Used in tests and whenever several logical nodes share a process;
/// the Redis bus covers real deployments.
#[derive(Default)]
pub struct PublisherRegistry {
    buses: DashMap<NodeId, Arc<dyn SignalBus>>,
}

impl PublisherRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a node's bus
    pub fn register(&self, node: impl Into<NodeId>, bus: Arc<dyn SignalBus>) {
        self.buses.insert(node.into(), bus);
    }
}

#[async_trait]
impl RemotePublisher for PublisherRegistry {
    async fn publish_remote(&self, node: &NodeId, signal: Signal) -> SignalResult<()> {
        let bus = self
            .buses
            .get(node)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SignalError::Routing(format!("no bus registered for node {}", node)))?;
        bus.publish(signal).await
    }
}

/// Ownership-aware signal router
pub struct SignalRouter {
    local: Arc<dyn SignalBus>,
    resolver: Arc<dyn OwnershipResolver>,
    remote: Arc<dyn RemotePublisher>,
    window: Mutex<LruCache<String, Instant>>,
    window_ttl: Duration,
    duplicates: AtomicU64,
}

impl SignalRouter {
    /// Build a router over a local bus
    pub fn new(
        local: Arc<dyn SignalBus>,
        resolver: Arc<dyn OwnershipResolver>,
        remote: Arc<dyn RemotePublisher>,
    ) -> Self {
        let capacity = NonZeroUsize::new(WINDOW_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            local,
            resolver,
            remote,
            window: Mutex::new(LruCache::new(capacity)),
            window_ttl: DUPLICATE_WINDOW,
            duplicates: AtomicU64::new(0),
        }
    }

    /// Signals suppressed by the duplicate window
    pub fn duplicates_suppressed(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// True when the fingerprint was routed within the window
    fn is_duplicate(&self, fingerprint: &str) -> bool {
        let mut window = self.window.lock();
        if let Some(seen) = window.get(fingerprint) {
            if seen.elapsed() < self.window_ttl {
                return true;
            }
        }
        window.put(fingerprint.to_string(), Instant::now());
        false
    }
}

#[async_trait]
impl SignalBus for SignalRouter {
    async fn publish(&self, signal: Signal) -> SignalResult<()> {
        let fingerprint = signal.fingerprint();
        if self.is_duplicate(&fingerprint) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(task = %signal.task_id, "duplicate signal suppressed");
            return Ok(());
        }

        match self.resolver.resolve_task_owner(&signal.task_id).await {
            Ok(resolution) if resolution.is_local => self.local.publish(signal).await,
            Ok(resolution) => {
                tracing::debug!(
                    task = %signal.task_id,
                    owner = %resolution.node,
                    "routing signal to owner node"
                );
                self.remote.publish_remote(&resolution.node, signal).await
            }
            // Unowned targets get best-effort local delivery; a local
            // subscriber may still exist before ownership is claimed.
            Err(ResolveError::NoOwner(_)) => self.local.publish(signal).await,
            Err(ResolveError::Backend(err)) => Err(SignalError::Routing(err)),
        }
    }

    async fn subscribe(&self, task_id: &str) -> SignalResult<SignalReceiver> {
        self.local.subscribe(task_id).await
    }

    async fn unsubscribe(&self, task_id: &str) {
        self.local.unsubscribe(task_id).await
    }

    async fn close(&self) {
        self.local.close().await
    }

    fn healthy(&self) -> bool {
        self.local.healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalSignalBus;
    use crate::signal::SignalKind;
    use troupe_core::StaticResolver;

    fn steer(task: &str, payload: u8) -> Signal {
        Signal::new(SignalKind::Steer, task, vec![payload])
    }

    fn two_node_setup() -> (SignalRouter, Arc<LocalSignalBus>, Arc<LocalSignalBus>) {
        let local = Arc::new(LocalSignalBus::new());
        let remote_bus = Arc::new(LocalSignalBus::new());
        let registry = Arc::new(PublisherRegistry::new());
        registry.register("node-b", remote_bus.clone());
        let resolver = Arc::new(StaticResolver::all_local("node-a"));
        resolver.assign("remote-task", "node-b");
        let router = SignalRouter::new(local.clone(), resolver, registry);
        (router, local, remote_bus)
    }

    #[tokio::test]
    async fn test_local_target_delivered_locally() {
        let (router, local, _) = two_node_setup();
        let rx = local.subscribe("here").await.unwrap();
        router.publish(steer("here", 1)).await.unwrap();
        assert_eq!(rx.recv().await.map(|s| s.payload), Some(vec![1]));
    }

    #[tokio::test]
    async fn test_remote_target_routed_to_owner_bus() {
        let (router, _, remote_bus) = two_node_setup();
        let rx = remote_bus.subscribe("remote-task").await.unwrap();
        router.publish(steer("remote-task", 2)).await.unwrap();
        assert_eq!(rx.recv().await.map(|s| s.payload), Some(vec![2]));
    }

    #[tokio::test]
    async fn test_duplicate_signal_suppressed_within_window() {
        let (router, local, _) = two_node_setup();
        let rx = local.subscribe("here").await.unwrap();
        let signal = steer("here", 3);
        router.publish(signal.clone()).await.unwrap();
        router.publish(signal).await.unwrap();
        assert_eq!(router.duplicates_suppressed(), 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unregistered_node_is_routing_error() {
        let local = Arc::new(LocalSignalBus::new());
        let registry = Arc::new(PublisherRegistry::new());
        let resolver = Arc::new(StaticResolver::all_local("node-a"));
        resolver.assign("t", "node-zzz");
        let router = SignalRouter::new(local, resolver, registry);
        assert!(matches!(
            router.publish(steer("t", 1)).await,
            Err(SignalError::Routing(_))
        ));
    }
}
