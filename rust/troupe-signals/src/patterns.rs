//! Steer, interrupt, and collect
//!
//! The three message patterns built on the signal bus. Steer carries a
//! parameter map the task applies at its own discretion; interrupt
//! asks the worker runtime to cancel the task's context; collect
//! gathers results from a set of tasks over auxiliary per-task
//! channels.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::bus::SignalBus;
use crate::error::{SignalError, SignalResult};
use crate::signal::{Signal, SignalKind};

/// Steer payload: parameter names to opaque values.
///
/// Multiple steers are delivered in send order; latest-wins is the
/// convention but task code decides whether and when to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteerPayload {
    /// Parameters to adjust
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Interrupt payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptPayload {
    /// Allow a cleanup window before the context is cut off
    pub graceful: bool,
    /// Operator supplied reason
    pub reason: String,
    /// Cleanup window for graceful interrupts
    #[serde(default)]
    pub cleanup_timeout_ms: u64,
}

impl InterruptPayload {
    /// Cleanup window as a duration
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }
}

/// Collect payload: a task's result bytes or its error string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectPayload {
    /// Reporting task
    pub task_id: String,
    /// Result value on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error string on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Auxiliary channel a task's collect messages are published on
pub fn collect_channel(task_id: &str) -> String {
    format!("collect:{}", task_id)
}

/// Build a steer signal; the parameter map must be non-empty
pub fn steer(
    task_id: &str,
    params: BTreeMap<String, serde_json::Value>,
) -> SignalResult<Signal> {
    if task_id.is_empty() {
        return Err(SignalError::InvalidTaskId);
    }
    if params.is_empty() {
        return Err(SignalError::Codec(
            "steer requires a non-empty parameter map".to_string(),
        ));
    }
    let payload = serde_json::to_vec(&SteerPayload { params })?;
    Ok(Signal::new(SignalKind::Steer, task_id, payload))
}

/// Decode a steer signal's parameter map
pub fn decode_steer(signal: &Signal) -> SignalResult<SteerPayload> {
    Ok(serde_json::from_slice(&signal.payload)?)
}

/// Build an interrupt signal
pub fn interrupt(
    task_id: &str,
    graceful: bool,
    reason: impl Into<String>,
    cleanup_timeout: Duration,
) -> SignalResult<Signal> {
    if task_id.is_empty() {
        return Err(SignalError::InvalidTaskId);
    }
    let payload = serde_json::to_vec(&InterruptPayload {
        graceful,
        reason: reason.into(),
        cleanup_timeout_ms: cleanup_timeout.as_millis() as u64,
    })?;
    Ok(Signal::new(SignalKind::Interrupt, task_id, payload))
}

/// Decode an interrupt signal's envelope
pub fn decode_interrupt(signal: &Signal) -> SignalResult<InterruptPayload> {
    Ok(serde_json::from_slice(&signal.payload)?)
}

/// Build the collect message a worker publishes on task completion
pub fn collect_result(
    task_id: &str,
    result: Option<serde_json::Value>,
    error: Option<String>,
) -> SignalResult<Signal> {
    if task_id.is_empty() {
        return Err(SignalError::InvalidTaskId);
    }
    let payload = serde_json::to_vec(&CollectPayload {
        task_id: task_id.to_string(),
        result,
        error,
    })?;
    Ok(Signal::new(
        SignalKind::Collect,
        collect_channel(task_id),
        payload,
    ))
}

/// Decode a collect message
pub fn decode_collect(signal: &Signal) -> SignalResult<CollectPayload> {
    Ok(serde_json::from_slice(&signal.payload)?)
}

/// Map an external signal request onto a [`Signal`].
///
/// The kind string selects the pattern; unknown kinds and empty task
/// identifiers are rejected before anything touches the bus.
pub fn signal_from_wire(kind: &str, task_id: &str, payload: Vec<u8>) -> SignalResult<Signal> {
    if task_id.is_empty() {
        return Err(SignalError::InvalidTaskId);
    }
    let kind: SignalKind = kind.parse()?;
    Ok(Signal::new(kind, task_id, payload))
}

/// Per-task collection verdict: result value or error string
pub type Collected = Result<serde_json::Value, String>;

/// Gathers completion results from a set of tasks
///
/// Subscribes to each target's auxiliary collect channel and waits for
/// all results or a deadline. Simultaneous completions are emitted in
/// subscription registration order.
#[derive(Clone)]
pub struct Collector {
    bus: Arc<dyn SignalBus>,
    targets: Vec<String>,
    timeout: Duration,
}

impl Collector {
    /// Collector over `targets`, in registration order
    pub fn new(bus: Arc<dyn SignalBus>, targets: Vec<String>, timeout: Duration) -> Self {
        Self {
            bus,
            targets,
            timeout,
        }
    }

    /// Wait for every target's result.
    ///
    /// - all targets error: [`SignalError::AggregateFailure`]
    /// - mixed: `Ok` with per-task error detail
    /// - deadline: [`SignalError::CollectTimeout`] carrying the
    ///   partial set
    /// - zero targets: empty map, immediately
    pub async fn collect(&self) -> SignalResult<BTreeMap<String, Collected>> {
        if self.targets.is_empty() {
            return Ok(BTreeMap::new());
        }

        let subs = self.subscribe_all().await?;
        let deadline = Instant::now() + self.timeout;
        let mut results: BTreeMap<String, Collected> = BTreeMap::new();
        let mut pending: Vec<usize> = (0..subs.len()).collect();

        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.unsubscribe_all().await;
                return Err(SignalError::CollectTimeout {
                    partial: results,
                    expected: self.targets.len(),
                });
            }

            // Poll pending receivers in registration order; select_all
            // resolves ties by index, which is exactly that order.
            let receivers: Vec<_> = pending
                .iter()
                .map(|&idx| {
                    let receiver = subs[idx].clone();
                    Box::pin(async move { receiver.recv().await })
                })
                .collect();
            match tokio::time::timeout(remaining, futures::future::select_all(receivers)).await {
                Err(_elapsed) => {
                    self.unsubscribe_all().await;
                    return Err(SignalError::CollectTimeout {
                        partial: results,
                        expected: self.targets.len(),
                    });
                }
                Ok((received, ready, _rest)) => {
                    let idx = pending.remove(ready);
                    let target = self.targets[idx].clone();
                    match received {
                        Some(signal) => match decode_collect(&signal) {
                            Ok(payload) => {
                                let entry = match (payload.result, payload.error) {
                                    (_, Some(error)) => Err(error),
                                    (Some(result), None) => Ok(result),
                                    (None, None) => Ok(serde_json::Value::Null),
                                };
                                results.insert(target, entry);
                            }
                            Err(err) => {
                                results.insert(target, Err(format!("undecodable result: {}", err)));
                            }
                        },
                        None => {
                            results.insert(target, Err("collect channel closed".to_string()));
                        }
                    }
                }
            }
        }

        self.unsubscribe_all().await;
        if results.values().all(|entry| entry.is_err()) {
            let errors = results
                .into_iter()
                .map(|(task, entry)| {
                    let message = entry.err().unwrap_or_default();
                    (task, message)
                })
                .collect();
            return Err(SignalError::AggregateFailure { errors });
        }
        Ok(results)
    }

    /// Streaming variant: results are emitted on a bounded channel in
    /// completion order; the channel closes when all results are in or
    /// the deadline fires.
    pub fn stream(&self, buffer: usize) -> tokio::sync::mpsc::Receiver<(String, Collected)> {
        let (tx, rx) = tokio::sync::mpsc::channel(buffer.max(1));
        let collector = self.clone();
        tokio::spawn(async move {
            if collector.targets.is_empty() {
                return;
            }
            let subs = match collector.subscribe_all().await {
                Ok(subs) => subs,
                Err(err) => {
                    tracing::warn!(error = %err, "collector stream failed to subscribe");
                    return;
                }
            };
            let deadline = Instant::now() + collector.timeout;
            let mut pending: Vec<usize> = (0..subs.len()).collect();

            while !pending.is_empty() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let receivers: Vec<_> = pending
                    .iter()
                    .map(|&idx| {
                        let receiver = subs[idx].clone();
                        Box::pin(async move { receiver.recv().await })
                    })
                    .collect();
                let Ok((received, ready, _rest)) =
                    tokio::time::timeout(remaining, futures::future::select_all(receivers)).await
                else {
                    break;
                };
                let idx = pending.remove(ready);
                let target = collector.targets[idx].clone();
                let entry = match received {
                    Some(signal) => match decode_collect(&signal) {
                        Ok(payload) => match (payload.result, payload.error) {
                            (_, Some(error)) => Err(error),
                            (Some(result), None) => Ok(result),
                            (None, None) => Ok(serde_json::Value::Null),
                        },
                        Err(err) => Err(format!("undecodable result: {}", err)),
                    },
                    None => Err("collect channel closed".to_string()),
                };
                if tx.send((target, entry)).await.is_err() {
                    break;
                }
            }
            collector.unsubscribe_all().await;
        });
        rx
    }

    async fn subscribe_all(&self) -> SignalResult<Vec<crate::ring::SignalReceiver>> {
        let mut subs = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            match self.bus.subscribe(&collect_channel(target)).await {
                Ok(receiver) => subs.push(receiver),
                Err(err) => {
                    // Roll back the partial registration.
                    for done in &self.targets[..subs.len()] {
                        self.bus.unsubscribe(&collect_channel(done)).await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(subs)
    }

    async fn unsubscribe_all(&self) {
        for target in &self.targets {
            self.bus.unsubscribe(&collect_channel(target)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalSignalBus;

    fn params(entries: &[(&str, i64)]) -> BTreeMap<String, serde_json::Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
            .collect()
    }

    #[test]
    fn test_steer_requires_params() {
        assert!(steer("t1", BTreeMap::new()).is_err());
        assert!(steer("", params(&[("x", 1)])).is_err());
        assert!(steer("t1", params(&[("x", 1)])).is_ok());
    }

    #[test]
    fn test_steer_roundtrip() {
        let signal = steer("t1", params(&[("temperature", 2)])).unwrap();
        let decoded = decode_steer(&signal).unwrap();
        assert_eq!(decoded.params.get("temperature"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_interrupt_roundtrip() {
        let signal = interrupt("t1", true, "operator stop", Duration::from_secs(5)).unwrap();
        let decoded = decode_interrupt(&signal).unwrap();
        assert!(decoded.graceful);
        assert_eq!(decoded.reason, "operator stop");
        assert_eq!(decoded.cleanup_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_wire_mapping_validation() {
        assert!(matches!(
            signal_from_wire("escalate", "t1", vec![]),
            Err(SignalError::InvalidSignalType(_))
        ));
        assert!(matches!(
            signal_from_wire("steer", "", vec![]),
            Err(SignalError::InvalidTaskId)
        ));
        let signal = signal_from_wire("interrupt", "t1", vec![]).unwrap();
        assert_eq!(signal.kind, SignalKind::Interrupt);
    }

    #[tokio::test]
    async fn test_collector_zero_targets_returns_immediately() {
        let bus: Arc<dyn SignalBus> = Arc::new(LocalSignalBus::new());
        let collector = Collector::new(bus, vec![], Duration::from_secs(5));
        let results = collector.collect().await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_collector_gathers_mixed_results() {
        let bus: Arc<dyn SignalBus> = Arc::new(LocalSignalBus::new());
        let collector = Collector::new(
            bus.clone(),
            vec!["a".to_string(), "b".to_string()],
            Duration::from_secs(5),
        );
        let handle = {
            let collector = collector.clone();
            tokio::spawn(async move { collector.collect().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(collect_result("a", Some(serde_json::json!(41)), None).unwrap())
            .await
            .unwrap();
        bus.publish(collect_result("b", None, Some("exploded".to_string())).unwrap())
            .await
            .unwrap();

        let results = handle.await.unwrap().unwrap();
        assert_eq!(results.get("a"), Some(&Ok(serde_json::json!(41))));
        assert_eq!(results.get("b"), Some(&Err("exploded".to_string())));
    }

    #[tokio::test]
    async fn test_collector_all_errors_is_aggregate_failure() {
        let bus: Arc<dyn SignalBus> = Arc::new(LocalSignalBus::new());
        let collector = Collector::new(
            bus.clone(),
            vec!["a".to_string()],
            Duration::from_secs(5),
        );
        let handle = {
            let collector = collector.clone();
            tokio::spawn(async move { collector.collect().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(collect_result("a", None, Some("nope".to_string())).unwrap())
            .await
            .unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, SignalError::AggregateFailure { .. }));
    }

    #[tokio::test]
    async fn test_collector_timeout_carries_partial_set() {
        let bus: Arc<dyn SignalBus> = Arc::new(LocalSignalBus::new());
        let collector = Collector::new(
            bus.clone(),
            vec!["fast".to_string(), "slow".to_string()],
            Duration::from_millis(150),
        );
        let handle = {
            let collector = collector.clone();
            tokio::spawn(async move { collector.collect().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(collect_result("fast", Some(serde_json::json!("done")), None).unwrap())
            .await
            .unwrap();

        let err = handle.await.unwrap().unwrap_err();
        let SignalError::CollectTimeout { partial, expected } = err else {
            panic!("expected timeout");
        };
        assert_eq!(expected, 2);
        assert_eq!(partial.get("fast"), Some(&Ok(serde_json::json!("done"))));
        assert!(!partial.contains_key("slow"));
    }

    #[tokio::test]
    async fn test_stream_emits_in_completion_order() {
        let bus: Arc<dyn SignalBus> = Arc::new(LocalSignalBus::new());
        let collector = Collector::new(
            bus.clone(),
            vec!["a".to_string(), "b".to_string()],
            Duration::from_secs(5),
        );
        let mut rx = collector.stream(8);
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(collect_result("b", Some(serde_json::json!(2)), None).unwrap())
            .await
            .unwrap();
        let (first, _) = rx.recv().await.unwrap();
        assert_eq!(first, "b");
        bus.publish(collect_result("a", Some(serde_json::json!(1)), None).unwrap())
            .await
            .unwrap();
        let (second, _) = rx.recv().await.unwrap();
        assert_eq!(second, "a");
        assert!(rx.recv().await.is_none());
    }
}
