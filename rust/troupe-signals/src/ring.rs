//! Bounded drop-oldest subscription channel
//!
//! Publish must never block: when a subscriber's buffer is full the
//! oldest signal is discarded and the new one enqueued. Steer and
//! interrupt are latest-wins, and collectors re-request anything they
//! miss, so losing the oldest entry is the correct policy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::signal::Signal;

struct ChannelInner {
    queue: Mutex<VecDeque<Signal>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Producer half, held by the bus
#[derive(Clone)]
pub struct SignalSender {
    inner: Arc<ChannelInner>,
}

/// Consumer half, handed to the subscriber
#[derive(Clone)]
pub struct SignalReceiver {
    inner: Arc<ChannelInner>,
}

/// Create a bounded drop-oldest channel
pub fn signal_channel(capacity: usize) -> (SignalSender, SignalReceiver) {
    let inner = Arc::new(ChannelInner {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        notify: Notify::new(),
        capacity: capacity.max(1),
        closed: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    });
    (
        SignalSender {
            inner: inner.clone(),
        },
        SignalReceiver { inner },
    )
}

impl SignalSender {
    /// Enqueue a signal, discarding the oldest entry when full.
    ///
    /// Returns `false` if the channel is closed.
    pub fn send(&self, signal: Signal) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(signal);
        }
        self.inner.notify.notify_one();
        true
    }

    /// Close the channel; pending signals remain receivable
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Signals discarded because the buffer was full
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl SignalReceiver {
    /// Receive the next signal, or `None` once the channel is closed
    /// and drained.
    pub async fn recv(&self) -> Option<Signal> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(signal) = self.inner.queue.lock().pop_front() {
                return Some(signal);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Take the next buffered signal without waiting
    pub fn try_recv(&self) -> Option<Signal> {
        self.inner.queue.lock().pop_front()
    }

    /// Whether the sender closed the channel
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Buffered signal count
    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalKind;

    fn steer_with(payload: u8) -> Signal {
        Signal::new(SignalKind::Steer, "t1", vec![payload])
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let (tx, rx) = signal_channel(2);
        tx.send(steer_with(1));
        tx.send(steer_with(2));
        tx.send(steer_with(3));
        assert_eq!(rx.recv().await.map(|s| s.payload), Some(vec![2]));
        assert_eq!(rx.recv().await.map(|s| s.payload), Some(vec![3]));
        assert_eq!(tx.dropped(), 1);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_send() {
        let (tx, rx) = signal_channel(4);
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(steer_with(7));
        let received = handle.await.unwrap();
        assert_eq!(received.map(|s| s.payload), Some(vec![7]));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (tx, rx) = signal_channel(4);
        tx.send(steer_with(1));
        tx.close();
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert!(!tx.send(steer_with(2)));
    }
}
