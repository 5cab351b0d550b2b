//! Task execution callback injected into lanes

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use troupe_core::{TaskContext, TaskOutcome};

/// Executes a dequeued task and reports its terminal outcome.
///
/// Lanes know nothing about agents, signals, or storage; the engine
/// supplies a runner that composes all of that. Worker panics are
/// caught by the lane around this call, so implementations may panic
/// without killing the worker.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run one task attempt to a terminal outcome
    async fn run(&self, ctx: TaskContext) -> TaskOutcome;
}

type BoxedRun =
    Box<dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send>> + Send + Sync>;

/// Closure adapter, used by tests and small embeddings
pub struct FnRunner {
    f: BoxedRun,
}

impl FnRunner {
    /// Wrap an async closure as a runner
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

#[async_trait]
impl TaskRunner for FnRunner {
    async fn run(&self, ctx: TaskContext) -> TaskOutcome {
        (self.f)(ctx).await
    }
}

/// Run one attempt with the worker-pool panic contract: a panicking
/// task function becomes a failed outcome and never unwinds into the
/// worker loop.
pub(crate) async fn run_captured(
    runner: &dyn TaskRunner,
    shutdown: &troupe_core::CancelToken,
    task: &crate::task::LaneTask,
) -> TaskOutcome {
    use futures::FutureExt;

    let ctx = TaskContext::new(
        task.workflow_id,
        task.task_id.clone(),
        task.payload.clone(),
        shutdown.child_token(),
    );
    match std::panic::AssertUnwindSafe(runner.run(ctx))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => TaskOutcome::failed(
            task.workflow_id,
            &task.task_id,
            format!("task panicked: {}", panic_message(&panic)),
        ),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
