//! Agent dispatch
//!
//! A task's `agent` field is an opaque tag resolved through this
//! registry at dispatch time. Agents registered at runtime join the
//! registry; there is no reflection and no global table.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use troupe_core::TaskContext;

/// A task function
///
/// Must honor context cancellation; may read the signal channel from
/// the context; may panic (the worker converts that into a failed
/// outcome).
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Execute one task attempt
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<serde_json::Value>;
}

type BoxedExecute = Box<
    dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send>>
        + Send
        + Sync,
>;

/// Closure adapter for small agents and tests
pub struct FnAgent {
    f: BoxedExecute,
}

impl FnAgent {
    /// Wrap an async closure as an agent
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

#[async_trait]
impl AgentHandler for FnAgent {
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<serde_json::Value> {
        (self.f)(ctx).await
    }
}

/// Agent kind to handler lookup
#[derive(Default)]
pub struct AgentRegistry {
    handlers: DashMap<String, Arc<dyn AgentHandler>>,
}

impl AgentRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an echo handler under the `default` kind
    pub fn with_default_echo() -> Self {
        let registry = Self::new();
        registry.register(
            troupe_graph::task::DEFAULT_AGENT,
            Arc::new(FnAgent::new(|ctx: TaskContext| async move {
                Ok(ctx.payload.clone())
            })),
        );
        registry
    }

    /// Register or replace a handler for an agent kind
    pub fn register(&self, kind: impl Into<String>, handler: Arc<dyn AgentHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Resolve a handler
    pub fn resolve(&self, kind: &str) -> Option<Arc<dyn AgentHandler>> {
        self.handlers.get(kind).map(|entry| entry.value().clone())
    }

    /// Registered agent kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_core::{CancelToken, WorkflowId};

    #[tokio::test]
    async fn test_registry_resolves_registered_kind() {
        let registry = AgentRegistry::new();
        registry.register(
            "double",
            Arc::new(FnAgent::new(|ctx: TaskContext| async move {
                let n = ctx.payload.as_i64().unwrap_or(0);
                Ok(serde_json::json!(n * 2))
            })),
        );
        let handler = registry.resolve("double").unwrap();
        let ctx = TaskContext::new(
            WorkflowId::new(),
            "t1",
            serde_json::json!(21),
            CancelToken::new(),
        );
        assert_eq!(handler.execute(ctx).await.unwrap(), serde_json::json!(42));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_none() {
        assert!(AgentRegistry::new().resolve("ghost").is_none());
    }

    #[tokio::test]
    async fn test_default_echo_returns_payload() {
        let registry = AgentRegistry::with_default_echo();
        let handler = registry.resolve("default").unwrap();
        let ctx = TaskContext::new(
            WorkflowId::new(),
            "t1",
            serde_json::json!({"k": "v"}),
            CancelToken::new(),
        );
        assert_eq!(
            handler.execute(ctx).await.unwrap(),
            serde_json::json!({"k": "v"})
        );
    }
}
