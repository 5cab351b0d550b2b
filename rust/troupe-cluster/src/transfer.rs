//! Ownership transfer broker
//!
//! The single authority that prevents double execution across shard
//! reassignments. Per shard it tracks the active fencing token, queued
//! work, in-flight work with the token it started under, and completed
//! workload identifiers. Any operation bearing a stale token is
//! rejected; a second completion of the same workload is a no-op.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use troupe_core::ShardKey;

use crate::error::{CoordinationError, CoordinationResult};

#[derive(Default)]
struct ShardRecord {
    active_token: u64,
    queued: VecDeque<(String, serde_json::Value)>,
    in_flight: HashMap<String, u64>,
    completed: HashSet<String>,
}

/// Snapshot handed to a shard's new owner at transfer time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSnapshot {
    /// Transferred shard
    pub shard: ShardKey,
    /// The token the new owner must operate under
    pub token: u64,
    /// Queued workload identifiers, in admission order
    pub queued: Vec<String>,
    /// In-flight workload identifiers
    pub in_flight: Vec<String>,
}

/// Stateful handoff broker; one short lock, all operations quick
#[derive(Default)]
pub struct TransferBroker {
    shards: Mutex<HashMap<ShardKey, ShardRecord>>,
}

impl TransferBroker {
    /// Empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the current owner's fencing token for a shard
    pub fn set_active_token(&self, shard: &ShardKey, token: u64) {
        let mut shards = self.shards.lock();
        shards.entry(shard.clone()).or_default().active_token = token;
    }

    /// Record queued work.
    ///
    /// Idempotent against completion: work already completed is not
    /// re-queued, and the call reports whether it queued anything.
    pub fn queue_work(
        &self,
        shard: &ShardKey,
        work_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> bool {
        let work_id = work_id.into();
        let mut shards = self.shards.lock();
        let record = shards.entry(shard.clone()).or_default();
        if record.completed.contains(&work_id)
            || record.in_flight.contains_key(&work_id)
            || record.queued.iter().any(|(id, _)| *id == work_id)
        {
            return false;
        }
        record.queued.push_back((work_id, payload));
        true
    }

    /// Move work to in-flight under the owner's token.
    ///
    /// Returns `Ok(false)` when the work already completed (skip it),
    /// and rejects tokens that are not the shard's active token.
    pub fn start_in_flight(
        &self,
        shard: &ShardKey,
        work_id: &str,
        owner_token: u64,
    ) -> CoordinationResult<bool> {
        let mut shards = self.shards.lock();
        let record = shards.entry(shard.clone()).or_default();
        if owner_token == 0 || owner_token != record.active_token {
            return Err(CoordinationError::InvalidFencingToken {
                shard: shard.clone(),
                token: owner_token,
            });
        }
        if record.completed.contains(work_id) {
            return Ok(false);
        }
        if let Some(pos) = record.queued.iter().position(|(id, _)| id == work_id) {
            record.queued.remove(pos);
        }
        record.in_flight.insert(work_id.to_string(), owner_token);
        Ok(true)
    }

    /// Complete in-flight work under the owner's token.
    ///
    /// The first completion returns `Ok(true)`; any later completion
    /// of the same workload returns `Ok(false)` without error, which
    /// suppresses double terminal outcomes.
    pub fn complete_in_flight(
        &self,
        shard: &ShardKey,
        work_id: &str,
        owner_token: u64,
    ) -> CoordinationResult<bool> {
        let mut shards = self.shards.lock();
        let record = shards.entry(shard.clone()).or_default();
        if owner_token == 0 || owner_token != record.active_token {
            return Err(CoordinationError::InvalidFencingToken {
                shard: shard.clone(),
                token: owner_token,
            });
        }
        if record.completed.contains(work_id) {
            return Ok(false);
        }
        record.in_flight.remove(work_id);
        record.completed.insert(work_id.to_string());
        Ok(true)
    }

    /// Rebind in-flight records to the new owner's token after a
    /// transfer.
    pub fn adopt_in_flight(&self, shard: &ShardKey, new_owner_token: u64) {
        let mut shards = self.shards.lock();
        let record = shards.entry(shard.clone()).or_default();
        record.active_token = new_owner_token;
        for token in record.in_flight.values_mut() {
            *token = new_owner_token;
        }
    }

    /// Replace the active token and return the work the new owner must
    /// pick up.
    ///
    /// After this call any operation under the old token fails
    /// fencing; the new owner acts only after [`adopt_in_flight`].
    ///
    /// [`adopt_in_flight`]: TransferBroker::adopt_in_flight
    pub fn transfer_shard(&self, shard: &ShardKey, new_owner_token: u64) -> TransferSnapshot {
        let mut shards = self.shards.lock();
        let record = shards.entry(shard.clone()).or_default();
        record.active_token = new_owner_token;
        let mut in_flight: Vec<String> = record.in_flight.keys().cloned().collect();
        in_flight.sort();
        TransferSnapshot {
            shard: shard.clone(),
            token: new_owner_token,
            queued: record.queued.iter().map(|(id, _)| id.clone()).collect(),
            in_flight,
        }
    }

    /// Queued payload lookup, for owners resuming transferred work
    pub fn queued_payload(&self, shard: &ShardKey, work_id: &str) -> Option<serde_json::Value> {
        let shards = self.shards.lock();
        shards.get(shard).and_then(|record| {
            record
                .queued
                .iter()
                .find(|(id, _)| id == work_id)
                .map(|(_, payload)| payload.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> ShardKey {
        ShardKey::new("s1")
    }

    #[test]
    fn test_stale_token_rejected_after_transfer() {
        let broker = TransferBroker::new();
        broker.set_active_token(&shard(), 1);
        broker.queue_work(&shard(), "w1", serde_json::json!({}));

        // Ownership moves: node B gets token 2.
        broker.transfer_shard(&shard(), 2);

        let err = broker.start_in_flight(&shard(), "w1", 1).unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidFencingToken { .. }));
        assert!(broker.start_in_flight(&shard(), "w1", 2).unwrap());
    }

    #[test]
    fn test_double_complete_is_silent_noop() {
        let broker = TransferBroker::new();
        broker.set_active_token(&shard(), 1);
        broker.queue_work(&shard(), "w1", serde_json::json!({}));
        broker.start_in_flight(&shard(), "w1", 1).unwrap();

        assert!(broker.complete_in_flight(&shard(), "w1", 1).unwrap());
        assert!(!broker.complete_in_flight(&shard(), "w1", 1).unwrap());
    }

    #[test]
    fn test_completed_work_not_requeued() {
        let broker = TransferBroker::new();
        broker.set_active_token(&shard(), 1);
        broker.queue_work(&shard(), "w1", serde_json::json!({}));
        broker.start_in_flight(&shard(), "w1", 1).unwrap();
        broker.complete_in_flight(&shard(), "w1", 1).unwrap();

        assert!(!broker.queue_work(&shard(), "w1", serde_json::json!({})));
        assert!(!broker.start_in_flight(&shard(), "w1", 1).unwrap());
    }

    #[test]
    fn test_zero_token_always_invalid() {
        let broker = TransferBroker::new();
        broker.set_active_token(&shard(), 0);
        let err = broker.start_in_flight(&shard(), "w1", 0).unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidFencingToken { .. }));
    }

    #[test]
    fn test_snapshot_lists_queued_and_in_flight() {
        let broker = TransferBroker::new();
        broker.set_active_token(&shard(), 1);
        broker.queue_work(&shard(), "queued-1", serde_json::json!({}));
        broker.queue_work(&shard(), "queued-2", serde_json::json!({}));
        broker.queue_work(&shard(), "running-1", serde_json::json!({}));
        broker.start_in_flight(&shard(), "running-1", 1).unwrap();

        let snapshot = broker.transfer_shard(&shard(), 2);
        assert_eq!(snapshot.queued, vec!["queued-1", "queued-2"]);
        assert_eq!(snapshot.in_flight, vec!["running-1"]);
        assert_eq!(snapshot.token, 2);
    }

    #[test]
    fn test_adopt_rebinds_in_flight_tokens() {
        let broker = TransferBroker::new();
        broker.set_active_token(&shard(), 1);
        broker.queue_work(&shard(), "w1", serde_json::json!({}));
        broker.start_in_flight(&shard(), "w1", 1).unwrap();

        broker.transfer_shard(&shard(), 2);
        broker.adopt_in_flight(&shard(), 2);

        // The new owner can complete adopted work under its token.
        assert!(broker.complete_in_flight(&shard(), "w1", 2).unwrap());
    }

    #[test]
    fn test_queue_work_deduplicates() {
        let broker = TransferBroker::new();
        broker.set_active_token(&shard(), 1);
        assert!(broker.queue_work(&shard(), "w1", serde_json::json!(1)));
        assert!(!broker.queue_work(&shard(), "w1", serde_json::json!(2)));
        assert_eq!(
            broker.queued_payload(&shard(), "w1"),
            Some(serde_json::json!(1))
        );
    }
}
