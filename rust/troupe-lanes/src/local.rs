//! In-memory lane

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use troupe_core::{CancelCause, CancelToken, MetricsRecorder, TaskOutcome};

use crate::config::{BackpressurePolicy, LaneConfig, RateLimitConfig};
use crate::error::{LaneError, LaneResult};
use crate::queue::LaneQueue;
use crate::runner::TaskRunner;
use crate::task::LaneTask;
use crate::{Lane, LaneStats, SubmitOutcome};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct WorkerHandle {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

struct Shared {
    name: String,
    config: LaneConfig,
    queue: Mutex<LaneQueue>,
    dedup: Mutex<HashSet<String>>,
    work_ready: Notify,
    space_freed: Notify,
    in_flight: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    redirected: AtomicU64,
    dropped: AtomicU64,
    deduplicated: AtomicU64,
    closed: AtomicBool,
    shutdown: CancelToken,
    limiter: Option<DirectLimiter>,
    runner: Arc<dyn TaskRunner>,
    metrics: Arc<dyn MetricsRecorder>,
    redirect_target: RwLock<Option<Arc<dyn Lane>>>,
}

/// In-memory lane: bounded queue plus a resizable worker pool
pub struct LocalLane {
    shared: Arc<Shared>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl LocalLane {
    /// Create the lane and start its worker pool
    pub fn new(
        name: impl Into<String>,
        config: LaneConfig,
        runner: Arc<dyn TaskRunner>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> LaneResult<Arc<Self>> {
        let name = name.into();
        config.validate(&name)?;
        let limiter = config.rate_limit.map(build_limiter).transpose()?;
        let shared = Arc::new(Shared {
            queue: Mutex::new(LaneQueue::new(config.priority)),
            dedup: Mutex::new(HashSet::new()),
            work_ready: Notify::new(),
            space_freed: Notify::new(),
            in_flight: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            redirected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancelToken::new(),
            limiter,
            runner,
            metrics,
            redirect_target: RwLock::new(None),
            name,
            config,
        });

        let lane = Arc::new(Self {
            shared: shared.clone(),
            workers: Mutex::new(Vec::new()),
        });
        lane.resize_workers(shared.config.workers);
        Ok(lane)
    }

    /// Wire the fallback lane a Redirect policy forwards into
    pub fn set_redirect_target(&self, target: Arc<dyn Lane>) {
        *self.shared.redirect_target.write() = Some(target);
    }

    /// Grow or shrink the worker pool
    ///
    /// Shrinking cancels surplus workers; each finishes its current
    /// task before exiting.
    pub fn resize_workers(&self, count: usize) {
        let mut workers = self.workers.lock();
        while workers.len() < count {
            let cancel = CancelToken::new();
            let shared = self.shared.clone();
            let worker_cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                worker_loop(shared, worker_cancel).await;
            });
            workers.push(WorkerHandle { cancel, handle });
        }
        while workers.len() > count {
            if let Some(worker) = workers.pop() {
                worker.cancel.cancel(CancelCause::Shutdown);
            }
        }
    }

    /// Admit, or report why not, without waiting.
    ///
    /// `Ok(None)` means the lane is at capacity and the policy decides.
    fn try_admit(&self, task: &LaneTask) -> LaneResult<Option<SubmitOutcome>> {
        let shared = &self.shared;
        let mut queue = shared.queue.lock();
        let occupied = queue.len() + shared.in_flight.load(Ordering::Relaxed);
        if occupied >= shared.config.capacity {
            return Ok(None);
        }
        if let Some(key) = &task.dedup_key {
            // Insert doubles as the membership check.
            if !shared.dedup.lock().insert(key.clone()) {
                shared.deduplicated.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(SubmitOutcome::Deduplicated));
            }
        }
        queue.push(task.clone());
        drop(queue);
        shared.work_ready.notify_one();
        shared.metrics.incr_counter("lane.admitted", 1);
        Ok(Some(SubmitOutcome::Admitted))
    }

    async fn redirect(&self, ctx: &CancelToken, task: LaneTask) -> LaneResult<SubmitOutcome> {
        let target = self.shared.redirect_target.read().clone();
        let Some(target) = target else {
            return Err(LaneError::Config(format!(
                "lane {}: redirect target not wired",
                self.shared.name
            )));
        };
        target.submit(ctx, task).await?;
        self.shared.redirected.fetch_add(1, Ordering::Relaxed);
        self.shared.metrics.incr_counter("lane.redirected", 1);
        tracing::debug!(lane = %self.shared.name, to = %target.name(), "lane full, task redirected");
        Ok(SubmitOutcome::Redirected {
            to: target.name().to_string(),
        })
    }

    fn acquire_rate_token(&self) -> LaneResult<()> {
        if let Some(limiter) = &self.shared.limiter {
            limiter.check().map_err(|_| LaneError::CapacityExceeded {
                lane: self.shared.name.clone(),
                capacity: self.shared.config.capacity,
            })?;
        }
        Ok(())
    }
}

fn build_limiter(config: RateLimitConfig) -> LaneResult<DirectLimiter> {
    let rate = NonZeroU32::new(config.rate_per_sec)
        .ok_or_else(|| LaneError::Config("rate_per_sec must be positive".to_string()))?;
    let burst = NonZeroU32::new(config.burst)
        .ok_or_else(|| LaneError::Config("burst must be positive".to_string()))?;
    Ok(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)))
}

async fn worker_loop(shared: Arc<Shared>, cancel: CancelToken) {
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.shutdown.cancelled() => break,
            task = next_task(&shared) => task,
        };
        run_task(&shared, task).await;
    }
}

async fn next_task(shared: &Arc<Shared>) -> LaneTask {
    loop {
        // Arm the notifier before checking so a push between the check
        // and the await is not missed.
        let notified = shared.work_ready.notified();
        let popped = shared.queue.lock().pop();
        if let Some(task) = popped {
            shared.in_flight.fetch_add(1, Ordering::Relaxed);
            return task;
        }
        notified.await;
    }
}

async fn run_task(shared: &Arc<Shared>, task: LaneTask) {
    let started = std::time::Instant::now();
    let outcome = crate::runner::run_captured(shared.runner.as_ref(), &shared.shutdown, &task).await;
    shared
        .metrics
        .observe_duration("lane.task_duration", started.elapsed());

    if let Some(key) = &task.dedup_key {
        shared.dedup.lock().remove(key);
    }
    record_outcome(shared, &outcome);
    shared.in_flight.fetch_sub(1, Ordering::Relaxed);
    shared.space_freed.notify_waiters();
}

fn record_outcome(shared: &Shared, outcome: &TaskOutcome) {
    use troupe_core::OutcomeKind;
    shared.processed.fetch_add(1, Ordering::Relaxed);
    match outcome.kind {
        OutcomeKind::Completed => {}
        OutcomeKind::Failed => {
            shared.failed.fetch_add(1, Ordering::Relaxed);
        }
        OutcomeKind::Cancelled => {
            shared.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }
    shared.metrics.incr_counter("lane.processed", 1);
}

#[async_trait]
impl Lane for LocalLane {
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn submit(&self, ctx: &CancelToken, task: LaneTask) -> LaneResult<SubmitOutcome> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(LaneError::Closed(shared.name.clone()));
        }

        if let Some(limiter) = &shared.limiter {
            match shared.config.policy {
                BackpressurePolicy::Block => {
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(LaneError::Cancelled(shared.name.clone())),
                        _ = shared.shutdown.cancelled() => return Err(LaneError::Closed(shared.name.clone())),
                        _ = limiter.until_ready() => {}
                    }
                }
                _ => self.acquire_rate_token()?,
            }
        }

        loop {
            if shared.closed.load(Ordering::Acquire) {
                return Err(LaneError::Closed(shared.name.clone()));
            }
            if let Some(outcome) = self.try_admit(&task)? {
                return Ok(outcome);
            }
            match &shared.config.policy {
                BackpressurePolicy::Drop => {
                    shared.dropped.fetch_add(1, Ordering::Relaxed);
                    shared.metrics.incr_counter("lane.dropped", 1);
                    return Err(LaneError::CapacityExceeded {
                        lane: shared.name.clone(),
                        capacity: shared.config.capacity,
                    });
                }
                BackpressurePolicy::Redirect { .. } => {
                    return self.redirect(ctx, task).await;
                }
                BackpressurePolicy::Block => {
                    // Arm before re-checking to avoid missing a free.
                    let freed = shared.space_freed.notified();
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(LaneError::Cancelled(shared.name.clone())),
                        _ = shared.shutdown.cancelled() => return Err(LaneError::Closed(shared.name.clone())),
                        _ = freed => {}
                    }
                }
            }
        }
    }

    async fn try_submit(&self, task: LaneTask) -> LaneResult<SubmitOutcome> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(LaneError::Closed(shared.name.clone()));
        }
        self.acquire_rate_token()?;
        if let Some(outcome) = self.try_admit(&task)? {
            return Ok(outcome);
        }
        match &shared.config.policy {
            BackpressurePolicy::Redirect { .. } => {
                let ctx = CancelToken::new();
                self.redirect(&ctx, task).await
            }
            _ => {
                shared.dropped.fetch_add(1, Ordering::Relaxed);
                shared.metrics.incr_counter("lane.dropped", 1);
                Err(LaneError::CapacityExceeded {
                    lane: shared.name.clone(),
                    capacity: shared.config.capacity,
                })
            }
        }
    }

    async fn cancel_queued(&self, task_id: &str) -> Option<LaneTask> {
        let shared = &self.shared;
        let removed = shared.queue.lock().remove(task_id)?;
        if let Some(key) = &removed.dedup_key {
            shared.dedup.lock().remove(key);
        }
        shared.cancelled.fetch_add(1, Ordering::Relaxed);
        shared.processed.fetch_add(1, Ordering::Relaxed);
        shared.space_freed.notify_waiters();
        shared.metrics.incr_counter("lane.cancelled_queued", 1);
        Some(removed)
    }

    async fn stats(&self) -> LaneStats {
        let shared = &self.shared;
        LaneStats {
            name: shared.name.clone(),
            depth: shared.queue.lock().len(),
            in_flight: shared.in_flight.load(Ordering::Relaxed),
            processed: shared.processed.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            cancelled: shared.cancelled.load(Ordering::Relaxed),
            redirected: shared.redirected.load(Ordering::Relaxed),
            dropped: shared.dropped.load(Ordering::Relaxed),
            deduplicated: shared.deduplicated.load(Ordering::Relaxed),
            degraded: false,
        }
    }

    async fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.shutdown.cancel(CancelCause::Shutdown);
        shared.space_freed.notify_waiters();
        shared.work_ready.notify_waiters();

        let workers: Vec<WorkerHandle> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            worker.cancel.cancel(CancelCause::Shutdown);
            let _ = worker.handle.await;
        }
        tracing::debug!(lane = %shared.name, "lane closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::FnRunner;
    use std::time::Duration;
    use troupe_core::{NoopMetrics, TaskContext, WorkflowId};

    fn noop_runner() -> Arc<dyn TaskRunner> {
        Arc::new(FnRunner::new(|ctx: TaskContext| async move {
            TaskOutcome::completed(ctx.workflow_id, ctx.task_id.clone(), serde_json::json!(null))
        }))
    }

    fn task(id: &str) -> LaneTask {
        LaneTask::new(WorkflowId::new(), id, serde_json::Value::Null)
    }

    fn lane_with(config: LaneConfig, runner: Arc<dyn TaskRunner>) -> Arc<LocalLane> {
        LocalLane::new("test", config, runner, Arc::new(NoopMetrics)).unwrap()
    }

    #[tokio::test]
    async fn test_drop_policy_rejects_third_submission() {
        let config = LaneConfig {
            capacity: 2,
            policy: BackpressurePolicy::Drop,
            workers: 0,
            ..Default::default()
        };
        let lane = lane_with(config, noop_runner());
        let ctx = CancelToken::new();
        lane.submit(&ctx, task("a")).await.unwrap();
        lane.submit(&ctx, task("b")).await.unwrap();
        let err = lane.submit(&ctx, task("c")).await.unwrap_err();
        assert!(matches!(err, LaneError::CapacityExceeded { .. }));
        assert_eq!(lane.stats().await.depth, 2);
    }

    #[tokio::test]
    async fn test_capacity_zero_rejects_everything() {
        let config = LaneConfig {
            capacity: 0,
            policy: BackpressurePolicy::Drop,
            workers: 0,
            ..Default::default()
        };
        let lane = lane_with(config, noop_runner());
        let ctx = CancelToken::new();
        assert!(lane.submit(&ctx, task("a")).await.is_err());
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let runner = Arc::new(FnRunner::new(move |ctx: TaskContext| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ctx.task_id.clone());
                TaskOutcome::completed(ctx.workflow_id, ctx.task_id.clone(), serde_json::json!(null))
            }
        }));
        let lane = lane_with(
            LaneConfig {
                capacity: 16,
                workers: 1,
                ..Default::default()
            },
            runner,
        );
        let ctx = CancelToken::new();
        lane.submit(&ctx, task("a")).await.unwrap();
        lane.submit(&ctx, task("b")).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some("a".to_string()));
        assert_eq!(second, Some("b".to_string()));
        lane.close().await;
    }

    #[tokio::test]
    async fn test_panic_is_captured_not_fatal() {
        let runner = Arc::new(FnRunner::new(|ctx: TaskContext| async move {
            if ctx.task_id == "boom" {
                panic!("exploded");
            }
            TaskOutcome::completed(ctx.workflow_id, ctx.task_id.clone(), serde_json::json!(null))
        }));
        let lane = lane_with(
            LaneConfig {
                capacity: 16,
                workers: 1,
                ..Default::default()
            },
            runner,
        );
        let ctx = CancelToken::new();
        lane.submit(&ctx, task("boom")).await.unwrap();
        lane.submit(&ctx, task("fine")).await.unwrap();
        // Both tasks reach a terminal outcome; the worker survives.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if lane.stats().await.processed == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(lane.stats().await.failed, 1);
        lane.close().await;
    }

    #[tokio::test]
    async fn test_block_policy_unblocks_when_capacity_frees() {
        let runner = noop_runner();
        let lane = lane_with(
            LaneConfig {
                capacity: 1,
                policy: BackpressurePolicy::Block,
                workers: 0,
                ..Default::default()
            },
            runner,
        );
        let ctx = CancelToken::new();
        lane.submit(&ctx, task("a")).await.unwrap();

        let blocked = {
            let lane = lane.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { lane.submit(&ctx, task("b")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        lane.cancel_queued("a").await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), blocked).await.unwrap();
        assert!(matches!(result.unwrap(), Ok(SubmitOutcome::Admitted)));
    }

    #[tokio::test]
    async fn test_block_submit_cancels_with_context() {
        let lane = lane_with(
            LaneConfig {
                capacity: 1,
                policy: BackpressurePolicy::Block,
                workers: 0,
                ..Default::default()
            },
            noop_runner(),
        );
        let ctx = CancelToken::new();
        lane.submit(&ctx, task("a")).await.unwrap();

        let submit_ctx = ctx.clone();
        let lane2 = lane.clone();
        let blocked = tokio::spawn(async move { lane2.submit(&submit_ctx, task("b")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cancel(CancelCause::Shutdown);
        let result = tokio::time::timeout(Duration::from_secs(1), blocked).await.unwrap();
        assert!(matches!(result.unwrap(), Err(LaneError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_redirect_forwards_when_full() {
        let fallback = lane_with(
            LaneConfig {
                capacity: 8,
                workers: 0,
                ..Default::default()
            },
            noop_runner(),
        );
        let lane = lane_with(
            LaneConfig {
                capacity: 1,
                policy: BackpressurePolicy::Redirect {
                    to: "test".to_string(),
                },
                workers: 0,
                ..Default::default()
            },
            noop_runner(),
        );
        lane.set_redirect_target(fallback.clone());
        let ctx = CancelToken::new();
        lane.submit(&ctx, task("a")).await.unwrap();
        let outcome = lane.submit(&ctx, task("b")).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Redirected { .. }));
        assert_eq!(fallback.stats().await.depth, 1);
        assert_eq!(lane.stats().await.redirected, 1);
    }

    #[tokio::test]
    async fn test_dedup_key_suppresses_duplicate() {
        let lane = lane_with(
            LaneConfig {
                capacity: 8,
                workers: 0,
                ..Default::default()
            },
            noop_runner(),
        );
        let ctx = CancelToken::new();
        let original = task("a").with_dedup_key("wf1:a");
        assert_eq!(
            lane.submit(&ctx, original.clone()).await.unwrap(),
            SubmitOutcome::Admitted
        );
        assert_eq!(
            lane.submit(&ctx, original).await.unwrap(),
            SubmitOutcome::Deduplicated
        );
        assert_eq!(lane.stats().await.depth, 1);
    }

    #[tokio::test]
    async fn test_closed_lane_rejects_submissions() {
        let lane = lane_with(
            LaneConfig {
                workers: 0,
                ..Default::default()
            },
            noop_runner(),
        );
        lane.close().await;
        let ctx = CancelToken::new();
        assert!(matches!(
            lane.submit(&ctx, task("a")).await,
            Err(LaneError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_drop_rejects_burst_overflow() {
        let lane = lane_with(
            LaneConfig {
                capacity: 64,
                policy: BackpressurePolicy::Drop,
                workers: 0,
                rate_limit: Some(RateLimitConfig {
                    rate_per_sec: 1,
                    burst: 2,
                }),
                ..Default::default()
            },
            noop_runner(),
        );
        let ctx = CancelToken::new();
        lane.submit(&ctx, task("a")).await.unwrap();
        lane.submit(&ctx, task("b")).await.unwrap();
        assert!(lane.submit(&ctx, task("c")).await.is_err());
    }
}
