//! Redis-backed lane
//!
//! Same contract as [`LocalLane`](crate::LocalLane), different
//! substrate: FIFO lanes use a Redis list (`LPUSH`/`BRPOP`), priority
//! lanes a sorted set (`ZADD`/`ZPOPMIN`). Admission runs a Lua script
//! that is atomic over the dedup check, the capacity check, the push,
//! and the optional redirect. In distributed mode every popped task is
//! checked against the ownership resolver before execution; tasks
//! owned elsewhere are re-queued onto the owner node's key.
//!
//! When Redis becomes unreachable the lane degrades: accepted tasks
//! are held in an in-memory promotion buffer until the next successful
//! Redis operation, and a sustained outage drains the buffer into the
//! fallback local lane (or fails fast, per configuration).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::task::JoinHandle;

use troupe_core::{CancelCause, CancelToken, MetricsRecorder, NodeId, OwnershipResolver};

use crate::config::{BackpressurePolicy, DegradedMode, LaneConfig};
use crate::error::{LaneError, LaneResult};
use crate::local::LocalLane;
use crate::runner::TaskRunner;
use crate::task::LaneTask;
use crate::{Lane, LaneStats, SubmitOutcome};

/// Spread between priority bands in sorted-set scores; within a band,
/// the enqueue timestamp breaks ties oldest-first.
const PRIORITY_SCALE: f64 = 1e13;

/// Atomic admission: dedup check, capacity check, push, optional
/// redirect. KEYS = [queue, dedup ("" to skip), redirect ("" to skip)];
/// ARGV = [envelope, capacity, priority flag, score, dedup TTL ms].
const ADMIT_SCRIPT: &str = r#"
if KEYS[2] ~= '' then
  if redis.call('EXISTS', KEYS[2]) == 1 then
    return 'dup'
  end
end
local depth
if ARGV[3] == '1' then
  depth = redis.call('ZCARD', KEYS[1])
else
  depth = redis.call('LLEN', KEYS[1])
end
if depth >= tonumber(ARGV[2]) then
  if KEYS[3] ~= '' then
    redis.call('LPUSH', KEYS[3], ARGV[1])
    return 'redirect'
  end
  return 'full'
end
if ARGV[3] == '1' then
  redis.call('ZADD', KEYS[1], ARGV[4], ARGV[1])
else
  redis.call('LPUSH', KEYS[1], ARGV[1])
end
if KEYS[2] ~= '' then
  redis.call('SET', KEYS[2], '1', 'PX', ARGV[5])
end
return 'ok'
"#;

/// Connection and keyspace settings shared by the Redis lanes of a node
#[derive(Debug, Clone)]
pub struct RedisLaneSettings {
    /// Redis connection URL
    pub url: String,
    /// Keyspace prefix, e.g. `troupe`
    pub key_prefix: String,
    /// Local node identifier, used for node-addressed re-queueing
    pub node_id: NodeId,
    /// `BRPOP` timeout per dequeue attempt
    pub pop_timeout: Duration,
    /// Interval of the substrate health probe
    pub probe_interval: Duration,
}

impl RedisLaneSettings {
    /// Settings with conventional defaults for a node
    pub fn new(url: impl Into<String>, node_id: impl Into<NodeId>) -> Self {
        Self {
            url: url.into(),
            key_prefix: "troupe".to_string(),
            node_id: node_id.into(),
            pop_timeout: Duration::from_secs(1),
            probe_interval: Duration::from_secs(2),
        }
    }
}

struct RedisShared {
    name: String,
    config: LaneConfig,
    settings: RedisLaneSettings,
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<ConnectionManager>>,
    admit_script: redis::Script,
    runner: Arc<dyn TaskRunner>,
    metrics: Arc<dyn MetricsRecorder>,
    resolver: Option<Arc<dyn OwnershipResolver>>,
    fallback: Option<Arc<LocalLane>>,
    promotion: Mutex<VecDeque<LaneTask>>,
    degraded: AtomicBool,
    outage_since: Mutex<Option<Instant>>,
    closed: AtomicBool,
    shutdown: CancelToken,
    in_flight: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    redirected: AtomicU64,
    dropped: AtomicU64,
    deduplicated: AtomicU64,
    requeued: AtomicU64,
    unowned_dropped: AtomicU64,
}

impl RedisShared {
    fn queue_key(&self) -> String {
        self.queue_key_for(&self.name)
    }

    fn queue_key_for(&self, lane: &str) -> String {
        if self.config.priority {
            format!("{}:lane:{}:z", self.settings.key_prefix, lane)
        } else {
            format!("{}:lane:{}:q", self.settings.key_prefix, lane)
        }
    }

    fn node_queue_key(&self, node: &str) -> String {
        if self.config.priority {
            format!(
                "{}:lane:{}:node:{}:z",
                self.settings.key_prefix, self.name, node
            )
        } else {
            format!(
                "{}:lane:{}:node:{}:q",
                self.settings.key_prefix, self.name, node
            )
        }
    }

    fn dedup_storage_key(&self, key: &str) -> String {
        format!("{}:lane:{}:dedup:{}", self.settings.key_prefix, self.name, key)
    }

    fn redirect_queue_key(&self) -> String {
        match &self.config.policy {
            BackpressurePolicy::Redirect { to } => {
                // Redirected envelopes always land on the target's FIFO
                // list; the target lane must be list-backed.
                format!("{}:lane:{}:q", self.settings.key_prefix, to)
            }
            _ => String::new(),
        }
    }

    fn score(&self, task: &LaneTask) -> f64 {
        -(task.priority as f64) * PRIORITY_SCALE + task.enqueued_at.timestamp_millis() as f64
    }

    async fn connection(&self) -> LaneResult<ConnectionManager> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(LaneError::from)?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn note_success(&self) {
        *self.outage_since.lock() = None;
        if self.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!(lane = %self.name, "redis substrate recovered");
            self.metrics.incr_counter("lane.recovered", 1);
        }
    }

    fn note_failure(&self) {
        let mut outage = self.outage_since.lock();
        if outage.is_none() {
            *outage = Some(Instant::now());
        }
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(lane = %self.name, "redis substrate unreachable, lane degraded");
            self.metrics.incr_counter("lane.degraded", 1);
        }
    }

    fn outage_exceeded(&self) -> bool {
        self.outage_since
            .lock()
            .map(|since| since.elapsed() >= self.config.degrade_after())
            .unwrap_or(false)
    }

    /// Admit through the Lua script. Maps the script's status string.
    async fn admit_remote(&self, task: &LaneTask) -> LaneResult<Option<SubmitOutcome>> {
        let mut conn = self.connection().await?;
        let envelope =
            serde_json::to_vec(task).map_err(|e| LaneError::Substrate(e.to_string()))?;
        let dedup_key = task
            .dedup_key
            .as_deref()
            .map(|k| self.dedup_storage_key(k))
            .unwrap_or_default();
        let status: String = self
            .admit_script
            .key(self.queue_key())
            .key(dedup_key)
            .key(self.redirect_queue_key())
            .arg(envelope)
            .arg(self.config.capacity)
            .arg(if self.config.priority { "1" } else { "0" })
            .arg(self.score(task))
            .arg(self.config.dedup_ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(LaneError::from)?;
        self.note_success();

        match status.as_str() {
            "ok" => {
                self.metrics.incr_counter("lane.admitted", 1);
                Ok(Some(SubmitOutcome::Admitted))
            }
            "dup" => {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                Ok(Some(SubmitOutcome::Deduplicated))
            }
            "redirect" => {
                self.redirected.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_counter("lane.redirected", 1);
                match &self.config.policy {
                    BackpressurePolicy::Redirect { to } => Ok(Some(SubmitOutcome::Redirected {
                        to: to.clone(),
                    })),
                    _ => Ok(Some(SubmitOutcome::Admitted)),
                }
            }
            // Full: the caller applies the backpressure policy.
            _ => Ok(None),
        }
    }

    /// Push every buffered task back through the admission script.
    async fn flush_promotion_buffer(&self) {
        loop {
            let task = {
                let mut buffer = self.promotion.lock();
                match buffer.pop_front() {
                    Some(task) => task,
                    None => return,
                }
            };
            match self.admit_remote(&task).await {
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(lane = %self.name, error = %err, "promotion flush interrupted");
                    self.promotion.lock().push_front(task);
                    return;
                }
            }
        }
    }

    /// Drain the promotion buffer into the fallback local lane.
    async fn drain_to_fallback(&self) {
        let Some(fallback) = &self.fallback else {
            return;
        };
        let drained: Vec<LaneTask> = { self.promotion.lock().drain(..).collect() };
        if drained.is_empty() {
            return;
        }
        tracing::warn!(
            lane = %self.name,
            count = drained.len(),
            "sustained outage, draining promotion buffer into fallback lane"
        );
        let ctx = CancelToken::new();
        for task in drained {
            if let Err(err) = fallback.submit(&ctx, task).await {
                tracing::warn!(lane = %self.name, error = %err, "fallback admission failed");
            }
        }
    }
}

/// Redis-backed lane
pub struct RedisLane {
    shared: Arc<RedisShared>,
    workers: Mutex<Vec<(CancelToken, JoinHandle<()>)>>,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl RedisLane {
    /// Create the lane, its worker pool, and the health probe.
    ///
    /// `resolver` enables distributed ownership enforcement on
    /// dequeue; `fallback` receives buffered tasks after a sustained
    /// outage when the degraded mode is `Fallback`.
    pub fn new(
        name: impl Into<String>,
        config: LaneConfig,
        settings: RedisLaneSettings,
        runner: Arc<dyn TaskRunner>,
        metrics: Arc<dyn MetricsRecorder>,
        resolver: Option<Arc<dyn OwnershipResolver>>,
        fallback: Option<Arc<LocalLane>>,
    ) -> LaneResult<Arc<Self>> {
        let name = name.into();
        config.validate(&name)?;
        if config.degraded_mode == DegradedMode::Fallback && fallback.is_none() {
            return Err(LaneError::Config(format!(
                "lane {}: fallback degraded mode requires a fallback lane",
                name
            )));
        }
        let client =
            redis::Client::open(settings.url.as_str()).map_err(LaneError::from)?;
        let shared = Arc::new(RedisShared {
            client,
            conn: tokio::sync::Mutex::new(None),
            admit_script: redis::Script::new(ADMIT_SCRIPT),
            runner,
            metrics,
            resolver,
            fallback,
            promotion: Mutex::new(VecDeque::new()),
            degraded: AtomicBool::new(false),
            outage_since: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown: CancelToken::new(),
            in_flight: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            redirected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            unowned_dropped: AtomicU64::new(0),
            name,
            config,
            settings,
        });

        let lane = Arc::new(Self {
            shared: shared.clone(),
            workers: Mutex::new(Vec::new()),
            probe: Mutex::new(None),
        });
        for _ in 0..shared.config.workers {
            lane.spawn_worker();
        }
        let probe_shared = shared.clone();
        *lane.probe.lock() = Some(tokio::spawn(async move {
            probe_loop(probe_shared).await;
        }));
        Ok(lane)
    }

    fn spawn_worker(&self) {
        let cancel = CancelToken::new();
        let shared = self.shared.clone();
        let worker_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            worker_loop(shared, worker_cancel).await;
        });
        self.workers.lock().push((cancel, handle));
    }

    /// Grow or shrink the dequeue worker pool
    pub fn resize_workers(&self, count: usize) {
        loop {
            let current = self.workers.lock().len();
            if current < count {
                self.spawn_worker();
            } else if current > count {
                if let Some((cancel, _handle)) = self.workers.lock().pop() {
                    cancel.cancel(CancelCause::Shutdown);
                }
            } else {
                break;
            }
        }
    }
}

async fn probe_loop(shared: Arc<RedisShared>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = tokio::time::sleep(shared.settings.probe_interval) => {}
        }
        let ping = async {
            let mut conn = shared.connection().await?;
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .map_err(LaneError::from)
        }
        .await;

        match ping {
            Ok(_) => {
                shared.note_success();
                shared.flush_promotion_buffer().await;
            }
            Err(_) => {
                shared.note_failure();
                if shared.outage_exceeded() && shared.config.degraded_mode == DegradedMode::Fallback
                {
                    shared.drain_to_fallback().await;
                }
            }
        }
    }
}

async fn worker_loop(shared: Arc<RedisShared>, cancel: CancelToken) {
    loop {
        if shared.shutdown.is_cancelled() || cancel.is_cancelled() {
            return;
        }
        let popped = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = cancel.cancelled() => return,
            popped = pop_one(&shared) => popped,
        };
        let Some(raw) = popped else {
            continue;
        };
        let task: LaneTask = match serde_json::from_slice(&raw) {
            Ok(task) => task,
            Err(err) => {
                tracing::warn!(lane = %shared.name, error = %err, "dropping undecodable envelope");
                continue;
            }
        };

        if let Some(resolver) = &shared.resolver {
            match resolver.resolve_task_owner(&task.task_id).await {
                Ok(resolution) if resolution.is_local => {}
                Ok(resolution) => {
                    requeue_to_node(&shared, &task, &resolution.node).await;
                    continue;
                }
                Err(troupe_core::ResolveError::NoOwner(_)) => {
                    shared.unowned_dropped.fetch_add(1, Ordering::Relaxed);
                    shared.metrics.incr_counter("lane.unowned_dropped", 1);
                    tracing::warn!(
                        lane = %shared.name,
                        task = %task.task_id,
                        "no shard owner yet, dropping task"
                    );
                    continue;
                }
                Err(err) => {
                    // Resolver backend hiccup: push back and retry later.
                    tracing::warn!(lane = %shared.name, error = %err, "owner resolution failed, re-queueing");
                    let node = shared.settings.node_id.clone();
                    requeue_to_node(&shared, &task, &node).await;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            }
        }

        shared.in_flight.fetch_add(1, Ordering::Relaxed);
        let outcome =
            crate::runner::run_captured(shared.runner.as_ref(), &shared.shutdown, &task).await;
        if let Some(key) = &task.dedup_key {
            release_dedup(&shared, key).await;
        }
        shared.processed.fetch_add(1, Ordering::Relaxed);
        match outcome.kind {
            troupe_core::OutcomeKind::Completed => {}
            troupe_core::OutcomeKind::Failed => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
            }
            troupe_core::OutcomeKind::Cancelled => {
                shared.cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }
        shared.metrics.incr_counter("lane.processed", 1);
        shared.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One dequeue attempt against the node-addressed key and the shared
/// key. Returns `None` on timeout or substrate failure.
async fn pop_one(shared: &Arc<RedisShared>) -> Option<Vec<u8>> {
    let mut conn = match shared.connection().await {
        Ok(conn) => conn,
        Err(_) => {
            shared.note_failure();
            tokio::time::sleep(shared.settings.probe_interval).await;
            return None;
        }
    };
    let node_key = shared.node_queue_key(&shared.settings.node_id);
    let main_key = shared.queue_key();

    if shared.config.priority {
        for key in [&node_key, &main_key] {
            let popped: Result<Vec<(Vec<u8>, f64)>, _> = conn.zpopmin(key, 1).await;
            match popped {
                Ok(mut entries) => {
                    if let Some((member, _score)) = entries.pop() {
                        shared.note_success();
                        return Some(member);
                    }
                }
                Err(err) => {
                    tracing::debug!(lane = %shared.name, error = %err, "zpopmin failed");
                    shared.note_failure();
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    return None;
                }
            }
        }
        shared.note_success();
        tokio::time::sleep(Duration::from_millis(100)).await;
        None
    } else {
        let popped: Result<Option<(String, Vec<u8>)>, _> = conn
            .brpop(
                vec![node_key, main_key],
                shared.settings.pop_timeout.as_secs() as f64,
            )
            .await;
        match popped {
            Ok(Some((_key, raw))) => {
                shared.note_success();
                Some(raw)
            }
            Ok(None) => {
                shared.note_success();
                None
            }
            Err(err) => {
                tracing::debug!(lane = %shared.name, error = %err, "brpop failed");
                shared.note_failure();
                tokio::time::sleep(Duration::from_millis(200)).await;
                None
            }
        }
    }
}

async fn requeue_to_node(shared: &Arc<RedisShared>, task: &LaneTask, node: &str) {
    let envelope = match serde_json::to_vec(task) {
        Ok(envelope) => envelope,
        Err(_) => return,
    };
    let key = shared.node_queue_key(node);
    let result: LaneResult<i64> = async {
        let mut conn = shared.connection().await?;
        if shared.config.priority {
            conn.zadd(key, envelope, shared.score(task))
                .await
                .map_err(LaneError::from)
        } else {
            conn.lpush(key, envelope).await.map_err(LaneError::from)
        }
    }
    .await;
    match result {
        Ok(_) => {
            shared.requeued.fetch_add(1, Ordering::Relaxed);
            shared.metrics.incr_counter("lane.requeued", 1);
        }
        Err(err) => {
            tracing::warn!(lane = %shared.name, error = %err, "re-queue to owner failed");
            shared.note_failure();
        }
    }
}

async fn release_dedup(shared: &Arc<RedisShared>, key: &str) {
    if let Ok(mut conn) = shared.connection().await {
        let _: Result<(), _> = conn.del(shared.dedup_storage_key(key)).await;
    }
}

#[async_trait]
impl Lane for RedisLane {
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn submit(&self, ctx: &CancelToken, task: LaneTask) -> LaneResult<SubmitOutcome> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(LaneError::Closed(shared.name.clone()));
        }

        loop {
            if shared.degraded.load(Ordering::Acquire) {
                return degraded_submit(shared, task).await;
            }
            match shared.admit_remote(&task).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => match &shared.config.policy {
                    BackpressurePolicy::Block => {
                        tokio::select! {
                            _ = ctx.cancelled() => return Err(LaneError::Cancelled(shared.name.clone())),
                            _ = shared.shutdown.cancelled() => return Err(LaneError::Closed(shared.name.clone())),
                            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                        }
                    }
                    _ => {
                        shared.dropped.fetch_add(1, Ordering::Relaxed);
                        shared.metrics.incr_counter("lane.dropped", 1);
                        return Err(LaneError::CapacityExceeded {
                            lane: shared.name.clone(),
                            capacity: shared.config.capacity,
                        });
                    }
                },
                Err(_) => return degraded_submit(shared, task).await,
            }
        }
    }

    async fn try_submit(&self, task: LaneTask) -> LaneResult<SubmitOutcome> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(LaneError::Closed(shared.name.clone()));
        }
        if shared.degraded.load(Ordering::Acquire) {
            return degraded_submit(shared, task).await;
        }
        match shared.admit_remote(&task).await {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => {
                shared.dropped.fetch_add(1, Ordering::Relaxed);
                shared.metrics.incr_counter("lane.dropped", 1);
                Err(LaneError::CapacityExceeded {
                    lane: shared.name.clone(),
                    capacity: shared.config.capacity,
                })
            }
            Err(_) => degraded_submit(shared, task).await,
        }
    }

    async fn cancel_queued(&self, task_id: &str) -> Option<LaneTask> {
        let shared = &self.shared;

        // Degraded holdings first: promotion buffer, then fallback.
        {
            let mut buffer = shared.promotion.lock();
            if let Some(pos) = buffer.iter().position(|t| t.task_id == task_id) {
                let removed = buffer.remove(pos);
                if removed.is_some() {
                    shared.cancelled.fetch_add(1, Ordering::Relaxed);
                    shared.processed.fetch_add(1, Ordering::Relaxed);
                }
                return removed;
            }
        }
        if let Some(fallback) = &shared.fallback {
            if let Some(removed) = fallback.cancel_queued(task_id).await {
                return Some(removed);
            }
        }

        let mut conn = shared.connection().await.ok()?;
        let key = shared.queue_key();
        let members: Vec<Vec<u8>> = if shared.config.priority {
            conn.zrange(&key, 0, -1).await.ok()?
        } else {
            conn.lrange(&key, 0, -1).await.ok()?
        };
        for raw in members {
            let Ok(task) = serde_json::from_slice::<LaneTask>(&raw) else {
                continue;
            };
            if task.task_id != task_id {
                continue;
            }
            let removed: i64 = if shared.config.priority {
                conn.zrem(&key, raw.clone()).await.ok()?
            } else {
                conn.lrem(&key, 1, raw.clone()).await.ok()?
            };
            if removed > 0 {
                if let Some(dk) = &task.dedup_key {
                    release_dedup(shared, dk).await;
                }
                shared.cancelled.fetch_add(1, Ordering::Relaxed);
                shared.processed.fetch_add(1, Ordering::Relaxed);
                shared.metrics.incr_counter("lane.cancelled_queued", 1);
                return Some(task);
            }
        }
        None
    }

    async fn stats(&self) -> LaneStats {
        let shared = &self.shared;
        let mut depth = shared.promotion.lock().len();
        if let Ok(mut conn) = shared.connection().await {
            let key = shared.queue_key();
            let remote: Result<usize, _> = if shared.config.priority {
                conn.zcard(&key).await
            } else {
                conn.llen(&key).await
            };
            if let Ok(remote_depth) = remote {
                depth += remote_depth;
            }
        }
        LaneStats {
            name: shared.name.clone(),
            depth,
            in_flight: shared.in_flight.load(Ordering::Relaxed),
            processed: shared.processed.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            cancelled: shared.cancelled.load(Ordering::Relaxed),
            redirected: shared.redirected.load(Ordering::Relaxed),
            dropped: shared.dropped.load(Ordering::Relaxed),
            deduplicated: shared.deduplicated.load(Ordering::Relaxed),
            degraded: shared.degraded.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.shutdown.cancel(CancelCause::Shutdown);
        if let Some(probe) = self.probe.lock().take() {
            probe.abort();
        }
        let workers: Vec<(CancelToken, JoinHandle<()>)> = std::mem::take(&mut *self.workers.lock());
        for (cancel, handle) in workers {
            cancel.cancel(CancelCause::Shutdown);
            let _ = handle.await;
        }
        if let Some(fallback) = &shared.fallback {
            fallback.close().await;
        }
        tracing::debug!(lane = %shared.name, "redis lane closed");
    }
}

/// Accept a task while the substrate is down: buffer it for promotion,
/// or hand it to the fallback lane once the outage is sustained, or
/// fail fast.
async fn degraded_submit(shared: &Arc<RedisShared>, task: LaneTask) -> LaneResult<SubmitOutcome> {
    shared.note_failure();
    match shared.config.degraded_mode {
        DegradedMode::FailFast => Err(LaneError::Substrate(format!(
            "lane {} degraded: redis unreachable",
            shared.name
        ))),
        DegradedMode::Fallback => {
            if shared.outage_exceeded() {
                shared.drain_to_fallback().await;
                if let Some(fallback) = &shared.fallback {
                    let ctx = CancelToken::new();
                    return fallback.submit(&ctx, task).await;
                }
            }
            shared.promotion.lock().push_back(task);
            shared.metrics.incr_counter("lane.buffered", 1);
            Ok(SubmitOutcome::Admitted)
        }
    }
}
