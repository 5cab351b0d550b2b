//! Redis pub/sub signal bus
//!
//! Each target task maps to a pub/sub channel embedding its
//! identifier. Subscribing spawns a reader task that decodes published
//! messages into the subscriber's bounded buffer, with the same
//! drop-oldest rule as the local bus. Pub/sub has no persistence, so
//! delivery is at-most-once per subscriber across restarts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tokio::task::JoinHandle;

use crate::bus::{SignalBus, DEFAULT_SIGNAL_BUFFER};
use crate::error::{SignalError, SignalResult};
use crate::ring::{signal_channel, SignalReceiver, SignalSender};
use crate::signal::Signal;

/// Connection and keyspace settings for the Redis bus
#[derive(Debug, Clone)]
pub struct RedisSignalSettings {
    /// Redis connection URL
    pub url: String,
    /// Keyspace prefix, e.g. `troupe`
    pub key_prefix: String,
    /// Per-subscription buffer size
    pub buffer: usize,
}

impl RedisSignalSettings {
    /// Settings with conventional defaults
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: "troupe".to_string(),
            buffer: DEFAULT_SIGNAL_BUFFER,
        }
    }
}

struct Subscription {
    sender: SignalSender,
    reader: JoinHandle<()>,
}

/// Distributed signal bus over Redis pub/sub
pub struct RedisSignalBus {
    settings: RedisSignalSettings,
    client: redis::Client,
    publish_conn: tokio::sync::Mutex<Option<ConnectionManager>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    closed: AtomicBool,
    healthy: AtomicBool,
}

impl RedisSignalBus {
    /// Create the bus; connections are established lazily
    pub fn new(settings: RedisSignalSettings) -> SignalResult<Arc<Self>> {
        let client = redis::Client::open(settings.url.as_str())?;
        Ok(Arc::new(Self {
            client,
            publish_conn: tokio::sync::Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            settings,
        }))
    }

    fn channel_name(&self, task_id: &str) -> String {
        format!("{}:signal:{}", self.settings.key_prefix, task_id)
    }

    async fn connection(&self) -> SignalResult<ConnectionManager> {
        let mut guard = self.publish_conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone()).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl SignalBus for RedisSignalBus {
    async fn publish(&self, signal: Signal) -> SignalResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SignalError::Closed);
        }
        let channel = self.channel_name(&signal.task_id);
        let encoded = serde_json::to_vec(&signal)?;
        let mut conn = self.connection().await.map_err(|err| {
            self.healthy.store(false, Ordering::Release);
            err
        })?;
        let result: Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(encoded)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_receivers) => {
                self.healthy.store(true, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                self.healthy.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }

    async fn subscribe(&self, task_id: &str) -> SignalResult<SignalReceiver> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SignalError::Closed);
        }
        {
            let subscriptions = self.subscriptions.lock();
            if subscriptions.contains_key(task_id) {
                return Err(SignalError::DuplicateSubscription(task_id.to_string()));
            }
        }

        let channel = self.channel_name(task_id);
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(&channel).await?;

        let (sender, receiver) = signal_channel(self.settings.buffer);
        let reader_sender = sender.clone();
        let reader_task = task_id.to_string();
        let reader = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let raw: Vec<u8> = match message.get_payload() {
                    Ok(raw) => raw,
                    Err(err) => {
                        tracing::warn!(task = %reader_task, error = %err, "unreadable signal payload");
                        continue;
                    }
                };
                match serde_json::from_slice::<Signal>(&raw) {
                    Ok(signal) => {
                        reader_sender.send(signal);
                    }
                    Err(err) => {
                        tracing::warn!(task = %reader_task, error = %err, "undecodable signal dropped");
                    }
                }
            }
            reader_sender.close();
        });

        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(task_id) {
            reader.abort();
            return Err(SignalError::DuplicateSubscription(task_id.to_string()));
        }
        subscriptions.insert(task_id.to_string(), Subscription { sender, reader });
        Ok(receiver)
    }

    async fn unsubscribe(&self, task_id: &str) {
        if let Some(subscription) = self.subscriptions.lock().remove(task_id) {
            subscription.reader.abort();
            subscription.sender.close();
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<Subscription> = {
            let mut subscriptions = self.subscriptions.lock();
            subscriptions.drain().map(|(_, sub)| sub).collect()
        };
        for subscription in drained {
            subscription.reader.abort();
            subscription.sender.close();
        }
    }

    fn healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.healthy.load(Ordering::Acquire)
    }
}

/// Remote publisher over Redis pub/sub, keyed by node.
///
/// Cross-node signals land on `{prefix}:node:{node}:signals`; each
/// node runs a [`NodeSignalListener`] that re-publishes arrivals onto
/// its local bus.
pub struct RedisRemotePublisher {
    settings: RedisSignalSettings,
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<ConnectionManager>>,
}

impl RedisRemotePublisher {
    /// Publisher over the shared Redis substrate
    pub fn new(settings: RedisSignalSettings) -> SignalResult<Self> {
        let client = redis::Client::open(settings.url.as_str())?;
        Ok(Self {
            settings,
            client,
            conn: tokio::sync::Mutex::new(None),
        })
    }

    fn node_channel(prefix: &str, node: &str) -> String {
        format!("{}:node:{}:signals", prefix, node)
    }

    async fn connection(&self) -> SignalResult<ConnectionManager> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone()).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl crate::router::RemotePublisher for RedisRemotePublisher {
    async fn publish_remote(
        &self,
        node: &troupe_core::NodeId,
        signal: Signal,
    ) -> SignalResult<()> {
        let channel = Self::node_channel(&self.settings.key_prefix, node);
        let encoded = serde_json::to_vec(&signal)?;
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(encoded)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Reader side of the node channel: decodes remote signals into the
/// node's local bus.
pub struct NodeSignalListener {
    handle: JoinHandle<()>,
}

impl NodeSignalListener {
    /// Subscribe to this node's channel and forward into `local`
    pub async fn start(
        settings: RedisSignalSettings,
        node_id: impl Into<troupe_core::NodeId>,
        local: Arc<dyn SignalBus>,
    ) -> SignalResult<Self> {
        let node_id = node_id.into();
        let channel = RedisRemotePublisher::node_channel(&settings.key_prefix, &node_id);
        let client = redis::Client::open(settings.url.as_str())?;
        let conn = client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(&channel).await?;

        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let raw: Vec<u8> = match message.get_payload() {
                    Ok(raw) => raw,
                    Err(_) => continue,
                };
                match serde_json::from_slice::<Signal>(&raw) {
                    Ok(signal) => {
                        if let Err(err) = local.publish(signal).await {
                            tracing::debug!(node = %node_id, error = %err, "local re-publish failed");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(node = %node_id, error = %err, "undecodable remote signal");
                    }
                }
            }
        });
        Ok(Self { handle })
    }

    /// Stop forwarding
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for NodeSignalListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_on_unreachable_substrate_errors() {
        let bus = RedisSignalBus::new(RedisSignalSettings::new("redis://127.0.0.1:1/")).unwrap();
        let signal = Signal::new(crate::SignalKind::Steer, "t1", vec![1]);
        assert!(bus.publish(signal).await.is_err());
        assert!(!bus.healthy());
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_operations() {
        let bus = RedisSignalBus::new(RedisSignalSettings::new("redis://127.0.0.1:1/")).unwrap();
        bus.close().await;
        assert!(matches!(
            bus.subscribe("t1").await,
            Err(SignalError::Closed)
        ));
    }
}
