//! Local signal bus

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{SignalError, SignalResult};
use crate::ring::{signal_channel, SignalReceiver, SignalSender};
use crate::signal::Signal;

/// Default per-subscription buffer size
pub const DEFAULT_SIGNAL_BUFFER: usize = 16;

/// Publish/subscribe bus keyed by task identity
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Deliver a signal to the target's subscriber, if any.
    ///
    /// Publishing to a task with no subscriber succeeds silently; this
    /// is not an error.
    async fn publish(&self, signal: Signal) -> SignalResult<()>;

    /// Open a subscription for a task identifier.
    ///
    /// A second subscription on the same identifier is rejected.
    async fn subscribe(&self, task_id: &str) -> SignalResult<SignalReceiver>;

    /// Drop the subscription for a task identifier
    async fn unsubscribe(&self, task_id: &str);

    /// Close the bus and every subscription channel
    async fn close(&self);

    /// Whether the bus can currently deliver
    fn healthy(&self) -> bool;
}

/// In-process bus: a subscription map behind a read/write lock.
///
/// Publish takes the read lock, subscribe/unsubscribe take the write
/// lock, so steady-state delivery never contends with itself.
pub struct LocalSignalBus {
    subscriptions: RwLock<HashMap<String, SignalSender>>,
    buffer: usize,
    closed: RwLock<bool>,
}

impl LocalSignalBus {
    /// Bus with the default buffer size
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SIGNAL_BUFFER)
    }

    /// Bus with a custom per-subscription buffer size
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
            closed: RwLock::new(false),
        }
    }

    /// Number of open subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl Default for LocalSignalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalBus for LocalSignalBus {
    async fn publish(&self, signal: Signal) -> SignalResult<()> {
        if *self.closed.read() {
            return Err(SignalError::Closed);
        }
        let subscriptions = self.subscriptions.read();
        if let Some(sender) = subscriptions.get(&signal.task_id) {
            sender.send(signal);
        }
        // No subscriber: silent drop by contract.
        Ok(())
    }

    async fn subscribe(&self, task_id: &str) -> SignalResult<SignalReceiver> {
        if *self.closed.read() {
            return Err(SignalError::Closed);
        }
        let mut subscriptions = self.subscriptions.write();
        if subscriptions.contains_key(task_id) {
            return Err(SignalError::DuplicateSubscription(task_id.to_string()));
        }
        let (sender, receiver) = signal_channel(self.buffer);
        subscriptions.insert(task_id.to_string(), sender);
        Ok(receiver)
    }

    async fn unsubscribe(&self, task_id: &str) {
        if let Some(sender) = self.subscriptions.write().remove(task_id) {
            sender.close();
        }
    }

    async fn close(&self) {
        *self.closed.write() = true;
        let mut subscriptions = self.subscriptions.write();
        for (_, sender) in subscriptions.drain() {
            sender.close();
        }
    }

    fn healthy(&self) -> bool {
        !*self.closed.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalKind;

    fn steer(task: &str, payload: u8) -> Signal {
        Signal::new(SignalKind::Steer, task, vec![payload])
    }

    #[tokio::test]
    async fn test_publish_receive_roundtrip() {
        let bus = LocalSignalBus::new();
        let rx = bus.subscribe("t1").await.unwrap();
        let sent = steer("t1", 9);
        bus.publish(sent.clone()).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_no_subscriber_is_silent_success() {
        let bus = LocalSignalBus::new();
        assert!(bus.publish(steer("ghost", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected() {
        let bus = LocalSignalBus::new();
        let _rx = bus.subscribe("t1").await.unwrap();
        let err = bus.subscribe("t1").await.unwrap_err();
        assert!(matches!(err, SignalError::DuplicateSubscription(_)));
    }

    #[tokio::test]
    async fn test_unsubscribe_frees_the_slot() {
        let bus = LocalSignalBus::new();
        let _rx = bus.subscribe("t1").await.unwrap();
        bus.unsubscribe("t1").await;
        assert!(bus.subscribe("t1").await.is_ok());
    }

    #[tokio::test]
    async fn test_buffer_overflow_latest_wins() {
        let bus = LocalSignalBus::with_buffer(2);
        let rx = bus.subscribe("t1").await.unwrap();
        bus.publish(steer("t1", 1)).await.unwrap();
        bus.publish(steer("t1", 2)).await.unwrap();
        bus.publish(steer("t1", 3)).await.unwrap();
        assert_eq!(rx.recv().await.map(|s| s.payload), Some(vec![2]));
        assert_eq!(rx.recv().await.map(|s| s.payload), Some(vec![3]));
    }

    #[tokio::test]
    async fn test_close_rejects_further_publishes() {
        let bus = LocalSignalBus::new();
        let rx = bus.subscribe("t1").await.unwrap();
        bus.close().await;
        assert!(!bus.healthy());
        assert!(matches!(
            bus.publish(steer("t1", 1)).await,
            Err(SignalError::Closed)
        ));
        // Subscription channel was closed too.
        assert!(rx.recv().await.is_none());
    }
}
