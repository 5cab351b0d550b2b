//! Orchestration engine
//!
//! Ties the subsystems together. A submission is compiled into an
//! execution plan; a driver task dispatches each layer into lanes and
//! advances on terminal outcomes; the lane workers call back into the
//! engine's [`TaskRunner`] implementation, which resolves the agent,
//! injects the signal channel, enforces timeouts and retries, reacts
//! to interrupts, and writes terminal state through storage.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use troupe_core::{
    CancelCause, CancelToken, MetricsRecorder, NoopMetrics, OutcomeKind, OwnershipResolver,
    TaskContext, TaskOutcome, WorkflowId, SIGNAL_CHANNEL_KEY,
};
use troupe_graph::{ExecutionPlan, Task};
use troupe_lanes::{
    LaneConfig, LaneManager, LaneManagerBuilder, LaneStats, LaneTask, RedisLaneSettings, TaskRunner,
};
use troupe_signals::{
    collect_result, decode_interrupt, signal_channel, signal_from_wire, LocalSignalBus, Signal,
    SignalKind, SignalSender,
};

use crate::agent::AgentRegistry;
use crate::bridge::{FenceVerdict, FencingGuard};
use crate::error::{EngineError, EngineResult};
use crate::storage::{MemoryStorage, Storage, WorkflowFilter};
use crate::workflow::{
    SubmitReceipt, TaskRecord, TaskRunState, WorkflowSnapshot, WorkflowState, WorkflowStatus,
    WorkflowSubmission,
};

/// External signal request, as carried by the RPC/HTTP façades
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRequest {
    /// Signal kind: `steer`, `interrupt`, or `collect`
    #[serde(rename = "type")]
    pub kind: String,
    /// Target task identifier
    pub task_id: String,
    /// Opaque payload bytes
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Bound on concurrently executing workflows (not tasks; lanes
    /// bound those)
    pub max_concurrent_workflows: usize,
    /// Per-task signal buffer size
    pub signal_buffer: usize,
    /// Timeout applied to tasks that declare none
    pub default_task_timeout: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 16,
            signal_buffer: troupe_signals::DEFAULT_SIGNAL_BUFFER,
            default_task_timeout: None,
        }
    }
}

/// Aggregated engine statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    /// Workflows currently executing
    pub running_workflows: usize,
    /// Per-lane statistics
    pub lanes: Vec<LaneStats>,
}

struct RunningWorkflow {
    plan: Arc<ExecutionPlan>,
    cancel: CancelToken,
    outcome_tx: mpsc::UnboundedSender<TaskOutcome>,
}

struct ExecCore {
    storage: Arc<dyn Storage>,
    agents: Arc<AgentRegistry>,
    bus: Arc<dyn troupe_signals::SignalBus>,
    metrics: Arc<dyn MetricsRecorder>,
    settings: EngineSettings,
    running: DashMap<WorkflowId, RunningWorkflow>,
    /// Present in distributed mode: every execution start and terminal
    /// writeback carries the node's fencing token
    fencing: Option<Arc<FencingGuard>>,
}

struct EngineRunner {
    core: Arc<ExecCore>,
}

#[async_trait]
impl TaskRunner for EngineRunner {
    async fn run(&self, ctx: TaskContext) -> TaskOutcome {
        self.core.execute_task(ctx).await
    }
}

impl ExecCore {
    async fn execute_task(&self, ctx: TaskContext) -> TaskOutcome {
        let workflow_id = ctx.workflow_id;
        let task_id = ctx.task_id.clone();

        let Some((plan, wf_cancel, outcome_tx)) = self.running.get(&workflow_id).map(|entry| {
            (
                entry.plan.clone(),
                entry.cancel.clone(),
                entry.outcome_tx.clone(),
            )
        }) else {
            // Dequeued after its workflow stopped running here, e.g. a
            // leftover from a previous incarnation.
            return TaskOutcome::cancelled(workflow_id, &task_id, "workflow not running");
        };
        let Some(task) = plan.task(&task_id).cloned() else {
            return TaskOutcome::failed(workflow_id, &task_id, "task not in execution plan");
        };

        if let Some(guard) = &self.fencing {
            match guard.begin(&workflow_id, &task_id).await {
                FenceVerdict::Allowed => {}
                FenceVerdict::Duplicate => {
                    let outcome =
                        TaskOutcome::cancelled(workflow_id, &task_id, "duplicate execution suppressed");
                    let _ = outcome_tx.send(outcome.clone());
                    return outcome;
                }
                FenceVerdict::Rejected => {
                    tracing::warn!(
                        workflow = %workflow_id,
                        task = %task_id,
                        "fencing rejected execution, shard owned elsewhere"
                    );
                    let outcome =
                        TaskOutcome::cancelled(workflow_id, &task_id, "fencing token rejected");
                    let _ = outcome_tx.send(outcome.clone());
                    return outcome;
                }
            }
        }

        // A poisoned workflow context cancels this attempt. The linker
        // is released at the terminal tail below; on a successful run
        // neither token ever cancels and the task would otherwise park
        // forever holding both of them.
        let linker = {
            let attempt_token = ctx.cancel_token().clone();
            let wf_token = wf_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = wf_token.cancelled() => attempt_token.cancel(CancelCause::Parent),
                    _ = attempt_token.cancelled() => {}
                }
            })
        };

        if let Err(err) = self
            .storage
            .save_task_state(
                &workflow_id,
                &task_id,
                TaskRecord {
                    state: TaskRunState::Running,
                    result: None,
                    error: None,
                    attempts: 0,
                    finished_at: None,
                },
            )
            .await
        {
            tracing::warn!(workflow = %workflow_id, task = %task_id, error = %err, "running-state writeback failed");
        }

        let (outcome, attempts) = self.run_attempts(&ctx, &task).await;
        linker.abort();

        // The coordinator validates the token before any state update;
        // a duplicate or stale terminal is dropped here.
        if let Some(guard) = &self.fencing {
            match guard.commit(&workflow_id, &task_id).await {
                FenceVerdict::Allowed => {}
                verdict => {
                    tracing::warn!(
                        workflow = %workflow_id,
                        task = %task_id,
                        ?verdict,
                        "terminal writeback suppressed by fencing"
                    );
                    let _ = outcome_tx.send(outcome.clone());
                    return outcome;
                }
            }
        }

        let record = TaskRecord::from_outcome(&outcome, attempts);
        if let Err(err) = self.storage.save_task_state(&workflow_id, &task_id, record).await {
            tracing::warn!(workflow = %workflow_id, task = %task_id, error = %err, "terminal writeback failed");
        }

        // Collectors listen on the auxiliary channel regardless of how
        // the task ended.
        match collect_result(&task_id, outcome.result.clone(), outcome.error.clone()) {
            Ok(message) => {
                if let Err(err) = self.bus.publish(message).await {
                    tracing::debug!(task = %task_id, error = %err, "collect publish failed");
                }
            }
            Err(err) => {
                tracing::debug!(task = %task_id, error = %err, "collect encode failed");
            }
        }

        self.metrics.incr_counter("engine.task_terminal", 1);
        let _ = outcome_tx.send(outcome.clone());
        outcome
    }

    /// Run the handler with retries, signal handling, and timeouts.
    async fn run_attempts(&self, ctx: &TaskContext, task: &Task) -> (TaskOutcome, u32) {
        let workflow_id = ctx.workflow_id;
        let task_id = ctx.task_id.clone();

        let Some(handler) = self.agents.resolve(&task.agent) else {
            return (
                TaskOutcome::failed(
                    workflow_id,
                    &task_id,
                    format!("no agent registered for kind {}", task.agent),
                ),
                0,
            );
        };

        // The raw subscription is consumed by the worker runtime; only
        // steer and collect signals are forwarded to task code.
        let raw_rx = match self.bus.subscribe(&task_id).await {
            Ok(rx) => Some(rx),
            Err(err) => {
                tracing::debug!(task = %task_id, error = %err, "running without signal subscription");
                None
            }
        };
        let (task_tx, task_rx) = signal_channel(self.settings.signal_buffer);
        ctx.insert_extension(SIGNAL_CHANNEL_KEY, Arc::new(task_rx));

        if let Some(timeout) = task.timeout().or(self.settings.default_task_timeout) {
            ctx.cancel_token()
                .cancel_after(timeout, CancelCause::DeadlineExceeded);
        }

        let max_attempts = task.retries.saturating_add(1);
        let mut attempt: u32 = 0;
        let mut signals_open = raw_rx.is_some();

        let outcome = 'attempts: loop {
            attempt += 1;
            let mut exec = Box::pin(handler.execute(ctx.clone()));
            loop {
                tokio::select! {
                    result = &mut exec => {
                        match result {
                            Ok(value) => {
                                break 'attempts TaskOutcome::completed(workflow_id, &task_id, value);
                            }
                            Err(err) => {
                                if attempt >= max_attempts {
                                    break 'attempts TaskOutcome::failed(
                                        workflow_id,
                                        &task_id,
                                        err.to_string(),
                                    );
                                }
                                tracing::debug!(
                                    task = %task_id,
                                    attempt,
                                    error = %err,
                                    "task attempt failed, retrying"
                                );
                                break;
                            }
                        }
                    }
                    _ = ctx.cancelled() => {
                        break 'attempts self.cancellation_outcome(ctx);
                    }
                    signal = recv_from(&raw_rx), if signals_open => {
                        match signal {
                            Some(signal) => self.handle_signal(ctx, signal, &task_tx),
                            None => signals_open = false,
                        }
                    }
                }
            }
        };

        if raw_rx.is_some() {
            self.bus.unsubscribe(&task_id).await;
        }
        task_tx.close();
        (outcome, attempt)
    }

    /// Interrupts act on the context; everything else is forwarded to
    /// the task-facing channel.
    fn handle_signal(&self, ctx: &TaskContext, signal: Signal, task_tx: &SignalSender) {
        match signal.kind {
            SignalKind::Interrupt => {
                let payload = decode_interrupt(&signal).unwrap_or_else(|_| {
                    troupe_signals::InterruptPayload {
                        graceful: false,
                        reason: "interrupt".to_string(),
                        cleanup_timeout_ms: 0,
                    }
                });
                let cause = CancelCause::Interrupted {
                    graceful: payload.graceful,
                    reason: payload.reason.clone(),
                };
                tracing::info!(
                    task = %ctx.task_id,
                    graceful = payload.graceful,
                    reason = %payload.reason,
                    "interrupt received"
                );
                if payload.graceful && payload.cleanup_timeout_ms > 0 {
                    ctx.cancel_token().cancel_after(payload.cleanup_timeout(), cause);
                } else {
                    ctx.cancel_token().cancel(cause);
                }
            }
            _ => {
                task_tx.send(signal);
            }
        }
    }

    fn cancellation_outcome(&self, ctx: &TaskContext) -> TaskOutcome {
        match ctx.cancel_token().cause() {
            Some(CancelCause::Interrupted { reason, .. }) => {
                TaskOutcome::interrupted(ctx.workflow_id, &ctx.task_id, reason)
            }
            Some(CancelCause::DeadlineExceeded) => {
                TaskOutcome::cancelled(ctx.workflow_id, &ctx.task_id, "deadline exceeded")
            }
            Some(cause) => TaskOutcome::cancelled(ctx.workflow_id, &ctx.task_id, cause.to_string()),
            None => TaskOutcome::cancelled(ctx.workflow_id, &ctx.task_id, "cancelled"),
        }
    }
}

async fn recv_from(rx: &Option<troupe_signals::SignalReceiver>) -> Option<Signal> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

/// Builds an [`Engine`] with injected collaborators
pub struct EngineBuilder {
    storage: Arc<dyn Storage>,
    agents: Arc<AgentRegistry>,
    bus: Arc<dyn troupe_signals::SignalBus>,
    metrics: Arc<dyn MetricsRecorder>,
    settings: EngineSettings,
    lanes: BTreeMap<String, LaneConfig>,
    redis: Option<RedisLaneSettings>,
    resolver: Option<Arc<dyn OwnershipResolver>>,
    fencing: Option<Arc<FencingGuard>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            agents: Arc::new(AgentRegistry::with_default_echo()),
            bus: Arc::new(LocalSignalBus::new()),
            metrics: Arc::new(NoopMetrics),
            settings: EngineSettings::default(),
            lanes: BTreeMap::new(),
            redis: None,
            resolver: None,
            fencing: None,
        }
    }
}

impl EngineBuilder {
    /// Builder with in-memory defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a storage backend
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    /// Inject the agent registry
    pub fn with_agents(mut self, agents: Arc<AgentRegistry>) -> Self {
        self.agents = agents;
        self
    }

    /// Inject the signal bus (a router in distributed mode)
    pub fn with_bus(mut self, bus: Arc<dyn troupe_signals::SignalBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Inject a metrics recorder
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Override engine tunables
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Register a lane
    pub fn lane(mut self, name: impl Into<String>, config: LaneConfig) -> Self {
        self.lanes.insert(name.into(), config);
        self
    }

    /// Enable the Redis lane substrate
    pub fn with_redis(mut self, settings: RedisLaneSettings) -> Self {
        self.redis = Some(settings);
        self
    }

    /// Enable distributed ownership enforcement
    pub fn with_resolver(mut self, resolver: Arc<dyn OwnershipResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Fence every execution start and terminal writeback
    pub fn with_fencing(mut self, fencing: Arc<FencingGuard>) -> Self {
        self.fencing = Some(fencing);
        self
    }

    /// Construct the engine and its lanes
    pub fn build(mut self) -> EngineResult<Arc<Engine>> {
        // Tasks that declare no lane land on `default`.
        self.lanes
            .entry(troupe_graph::task::DEFAULT_LANE.to_string())
            .or_default();

        let core = Arc::new(ExecCore {
            storage: self.storage,
            agents: self.agents,
            bus: self.bus,
            metrics: self.metrics.clone(),
            settings: self.settings.clone(),
            running: DashMap::new(),
            fencing: self.fencing,
        });

        let runner = Arc::new(EngineRunner { core: core.clone() });
        let mut lanes = LaneManagerBuilder::new(runner).with_metrics(self.metrics);
        if let Some(redis) = self.redis {
            lanes = lanes.with_redis(redis);
        }
        if let Some(resolver) = self.resolver {
            lanes = lanes.with_resolver(resolver);
        }
        for (name, config) in self.lanes {
            lanes = lanes.lane(name, config);
        }
        let lanes = Arc::new(lanes.build()?);

        Ok(Arc::new(Engine {
            semaphore: Arc::new(Semaphore::new(core.settings.max_concurrent_workflows)),
            core,
            lanes,
            drivers: DashMap::new(),
            shutdown: CancelToken::new(),
        }))
    }
}

/// The orchestration engine
pub struct Engine {
    core: Arc<ExecCore>,
    lanes: Arc<LaneManager>,
    semaphore: Arc<Semaphore>,
    drivers: DashMap<WorkflowId, JoinHandle<()>>,
    shutdown: CancelToken,
}

impl Engine {
    /// Builder with in-memory defaults
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Accept a workflow: compile, persist as pending, start driving
    pub async fn submit(&self, submission: WorkflowSubmission) -> EngineResult<SubmitReceipt> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Shutdown);
        }
        let mut graph = submission.build_graph()?;
        let plan = Arc::new(graph.compile()?);

        let id = WorkflowId::new();
        let snapshot = WorkflowSnapshot::new(id, submission);
        self.core.storage.save_workflow(&snapshot).await?;
        tracing::info!(workflow = %id, name = %snapshot.name, tasks = plan.len(), "workflow accepted");

        self.spawn_driver(id, plan);
        Ok(SubmitReceipt {
            id,
            status: WorkflowState::Pending,
        })
    }

    /// Submit and wait for the terminal status
    pub async fn execute(&self, submission: WorkflowSubmission) -> EngineResult<WorkflowStatus> {
        let receipt = self.submit(submission).await?;
        self.wait(&receipt.id).await
    }

    /// Wait until a workflow reaches a terminal state
    pub async fn wait(&self, id: &WorkflowId) -> EngineResult<WorkflowStatus> {
        if let Some((_, handle)) = self.drivers.remove(id) {
            let _ = handle.await;
        }
        self.status(id).await
    }

    /// Current wire-facing status
    pub async fn status(&self, id: &WorkflowId) -> EngineResult<WorkflowStatus> {
        let snapshot = self.core.storage.get_workflow(id).await?;
        Ok(snapshot.status())
    }

    /// List workflows through the storage interface
    pub async fn list(&self, filter: &WorkflowFilter) -> EngineResult<Vec<WorkflowStatus>> {
        let snapshots = self.core.storage.list_workflows(filter).await?;
        Ok(snapshots.iter().map(WorkflowSnapshot::status).collect())
    }

    /// Aggregated statistics
    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            running_workflows: self.core.running.len(),
            lanes: self.lanes.stats().await,
        }
    }

    /// Apply an external signal request.
    ///
    /// Steer and collect signals go to the bus. Interrupts
    /// additionally remove still-queued targets from their lanes with
    /// a cancelled terminal outcome.
    pub async fn signal(&self, request: SignalRequest) -> EngineResult<()> {
        let signal = signal_from_wire(&request.kind, &request.task_id, request.payload)?;

        if signal.kind == SignalKind::Interrupt {
            if let Some((lane, queued)) = self.lanes.cancel_queued(&signal.task_id).await {
                let reason = decode_interrupt(&signal)
                    .map(|payload| payload.reason)
                    .unwrap_or_else(|_| "interrupt".to_string());
                tracing::info!(
                    task = %signal.task_id,
                    lane = %lane,
                    "queued task removed by interrupt"
                );
                let outcome = TaskOutcome::cancelled(
                    queued.workflow_id,
                    &signal.task_id,
                    format!("interrupted: {}", reason),
                );
                let record = TaskRecord::from_outcome(&outcome, 0);
                if let Err(err) = self
                    .core
                    .storage
                    .save_task_state(&queued.workflow_id, &signal.task_id, record)
                    .await
                {
                    tracing::warn!(task = %signal.task_id, error = %err, "cancel writeback failed");
                }
                if let Some(entry) = self.core.running.get(&queued.workflow_id) {
                    let _ = entry.outcome_tx.send(outcome);
                }
                return Ok(());
            }
        }

        self.core.bus.publish(signal).await?;
        Ok(())
    }

    /// Cancel a workflow: poison its context and interrupt its tasks
    pub async fn cancel(&self, id: &WorkflowId, reason: impl Into<String>) -> EngineResult<()> {
        let reason = reason.into();
        let entry = self
            .core
            .running
            .get(id)
            .ok_or(EngineError::WorkflowNotFound(*id))?;
        let plan = entry.plan.clone();
        let outcome_tx = entry.outcome_tx.clone();
        entry.cancel.cancel(CancelCause::Interrupted {
            graceful: false,
            reason: reason.clone(),
        });
        drop(entry);

        // Queued tasks are removed in place; in-flight ones observe
        // the poisoned context.
        for task in plan.tasks() {
            if let Some((_, queued)) = self.lanes.cancel_queued(&task.id).await {
                if queued.workflow_id != *id {
                    continue;
                }
                let outcome = TaskOutcome::cancelled(*id, &task.id, format!("interrupted: {}", reason));
                let record = TaskRecord::from_outcome(&outcome, 0);
                let _ = self.core.storage.save_task_state(id, &task.id, record).await;
                let _ = outcome_tx.send(outcome);
            }
        }
        Ok(())
    }

    /// Replay non-terminal workflows from storage.
    ///
    /// Returns how many were requeued. Resubmission is idempotent:
    /// tasks with terminal records are skipped and lane deduplication
    /// keys suppress double admission.
    pub async fn recover(&self) -> EngineResult<usize> {
        let snapshots = self
            .core
            .storage
            .list_workflows(&WorkflowFilter::default())
            .await?;
        let mut recovered = 0;
        for snapshot in snapshots {
            if snapshot.state.is_terminal() || self.core.running.contains_key(&snapshot.id) {
                continue;
            }
            let mut graph = snapshot.submission.build_graph()?;
            let plan = Arc::new(graph.compile()?);
            tracing::info!(workflow = %snapshot.id, "recovering non-terminal workflow");
            self.spawn_driver(snapshot.id, plan);
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Graceful shutdown: stop intake, poison workflows, drain lanes,
    /// close the bus.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel(CancelCause::Shutdown);
        for entry in self.core.running.iter() {
            entry.value().cancel.cancel(CancelCause::Shutdown);
        }
        let drivers: Vec<(WorkflowId, JoinHandle<()>)> = {
            let keys: Vec<WorkflowId> = self.drivers.iter().map(|e| *e.key()).collect();
            keys.into_iter()
                .filter_map(|key| self.drivers.remove(&key))
                .collect()
        };
        for (_, handle) in drivers {
            let _ = handle.await;
        }
        self.lanes.close().await;
        self.core.bus.close().await;
        tracing::info!("engine shut down");
    }

    fn spawn_driver(&self, id: WorkflowId, plan: Arc<ExecutionPlan>) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();
        self.core.running.insert(
            id,
            RunningWorkflow {
                plan: plan.clone(),
                cancel: cancel.clone(),
                outcome_tx,
            },
        );
        let core = self.core.clone();
        let lanes = self.lanes.clone();
        let semaphore = self.semaphore.clone();
        let handle = tokio::spawn(async move {
            drive_workflow(core, lanes, semaphore, id, plan, cancel, outcome_rx).await;
        });
        self.drivers.insert(id, handle);
    }
}

fn task_priority(task: &Task) -> i32 {
    task.metadata
        .get("priority")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0) as i32
}

/// Per-workflow driver: dispatch layer by layer, advance on terminal
/// outcomes, finalize.
#[allow(clippy::too_many_arguments)]
async fn drive_workflow(
    core: Arc<ExecCore>,
    lanes: Arc<LaneManager>,
    semaphore: Arc<Semaphore>,
    id: WorkflowId,
    plan: Arc<ExecutionPlan>,
    cancel: CancelToken,
    mut outcome_rx: mpsc::UnboundedReceiver<TaskOutcome>,
) {
    // Workflow executions are independent; this bounds how many run at
    // once.
    let permit = tokio::select! {
        permit = semaphore.acquire_owned() => permit,
        _ = cancel.cancelled() => {
            finalize(&core, id, WorkflowState::Cancelled, Some("cancelled before start".to_string())).await;
            return;
        }
    };
    let Ok(_permit) = permit else {
        finalize(&core, id, WorkflowState::Failed, Some("engine closed".to_string())).await;
        return;
    };

    mark_running(&core, &id).await;

    let mut failure: Option<String> = None;
    let mut was_cancelled = false;

    'layers: for layer in plan.layers() {
        let mut pending: HashSet<String> = HashSet::new();

        for task_id in layer {
            if cancel.is_cancelled() {
                was_cancelled = true;
                break 'layers;
            }
            // Recovery replay: skip tasks that already reached a
            // terminal state.
            if let Ok(record) = core.storage.get_task_state(&id, task_id).await {
                if record.state.is_terminal() {
                    if record.state != TaskRunState::Completed {
                        failure = record.error.clone();
                        was_cancelled = record.state == TaskRunState::Cancelled;
                        break 'layers;
                    }
                    continue;
                }
            }
            let Some(task) = plan.task(task_id) else {
                failure = Some(format!("task {} missing from plan", task_id));
                break 'layers;
            };

            let lane_task = LaneTask::new(id, task_id.clone(), task.input.clone())
                .with_priority(task_priority(task))
                .with_dedup_key(format!("{}:{}", id, task_id));

            if let Err(err) = core
                .storage
                .save_task_state(
                    &id,
                    task_id,
                    TaskRecord {
                        state: TaskRunState::Queued,
                        result: None,
                        error: None,
                        attempts: 0,
                        finished_at: None,
                    },
                )
                .await
            {
                tracing::warn!(workflow = %id, task = %task_id, error = %err, "queued-state writeback failed");
            }

            match lanes.submit(&cancel, &task.lane, lane_task).await {
                Ok(_) => {
                    pending.insert(task_id.clone());
                }
                Err(err) => {
                    tracing::warn!(workflow = %id, task = %task_id, error = %err, "lane admission failed");
                    let outcome = TaskOutcome::failed(id, task_id, err.to_string());
                    let record = TaskRecord::from_outcome(&outcome, 0);
                    let _ = core.storage.save_task_state(&id, task_id, record).await;
                    failure = Some(err.to_string());
                    break 'layers;
                }
            }
        }

        while !pending.is_empty() {
            let received = tokio::select! {
                received = outcome_rx.recv() => received,
                _ = cancel.cancelled() => {
                    was_cancelled = true;
                    break 'layers;
                }
            };
            let Some(outcome) = received else {
                failure = Some("outcome channel closed".to_string());
                break 'layers;
            };
            if !pending.remove(&outcome.task_id) {
                continue;
            }
            match outcome.kind {
                OutcomeKind::Completed => {}
                OutcomeKind::Failed => {
                    was_cancelled = outcome.interrupted;
                    failure = outcome.error.clone();
                    break 'layers;
                }
                OutcomeKind::Cancelled => {
                    was_cancelled = true;
                    failure = outcome.error.clone();
                    break 'layers;
                }
            }
        }
    }

    let terminated = failure.is_some() || was_cancelled || cancel.is_cancelled();
    if terminated {
        // Poison in-flight attempts and sweep anything still queued.
        if !cancel.is_cancelled() {
            cancel.cancel(CancelCause::Shutdown);
        }
        for task in plan.tasks() {
            let terminal = core
                .storage
                .get_task_state(&id, &task.id)
                .await
                .map(|record| record.state.is_terminal())
                .unwrap_or(false);
            if terminal {
                continue;
            }
            if let Some((_, queued)) = lanes.cancel_queued(&task.id).await {
                if queued.workflow_id != id {
                    continue;
                }
                let outcome = TaskOutcome::cancelled(id, &task.id, "workflow terminated");
                let record = TaskRecord::from_outcome(&outcome, 0);
                let _ = core.storage.save_task_state(&id, &task.id, record).await;
            }
        }
    }

    let state = if was_cancelled || (terminated && failure.is_none()) {
        WorkflowState::Cancelled
    } else if failure.is_some() {
        WorkflowState::Failed
    } else {
        WorkflowState::Completed
    };
    finalize(&core, id, state, failure).await;
}

async fn mark_running(core: &Arc<ExecCore>, id: &WorkflowId) {
    match core.storage.get_workflow(id).await {
        Ok(mut snapshot) => {
            snapshot.state = WorkflowState::Running;
            snapshot.started_at = Some(chrono::Utc::now());
            if let Err(err) = core.storage.update_workflow(&snapshot).await {
                tracing::warn!(workflow = %id, error = %err, "running-state writeback failed");
            }
        }
        Err(err) => {
            tracing::warn!(workflow = %id, error = %err, "snapshot load failed");
        }
    }
}

async fn finalize(core: &Arc<ExecCore>, id: WorkflowId, state: WorkflowState, error: Option<String>) {
    core.running.remove(&id);
    match core.storage.get_workflow(&id).await {
        Ok(mut snapshot) => {
            snapshot.state = state;
            snapshot.error = error;
            snapshot.completed_at = Some(chrono::Utc::now());
            if let Err(err) = core.storage.update_workflow(&snapshot).await {
                tracing::warn!(workflow = %id, error = %err, "finalize writeback failed");
            }
        }
        Err(err) => {
            tracing::warn!(workflow = %id, error = %err, "snapshot load failed at finalize");
        }
    }
    core.metrics.incr_counter("engine.workflow_terminal", 1);
    tracing::info!(workflow = %id, state = %state, "workflow finalized");
}
