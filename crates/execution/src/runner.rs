//! Handlers and the registry that dispatches a [`TaskKind`] to them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use relay_core::{ExecutionId, TaskId, TaskKind, TaskStatus};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

/// Receives progress updates from running handlers.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Record `progress` (0-100) for an execution.
    async fn report(&self, execution_id: ExecutionId, progress: u8);
}

/// What a handler can see about the execution it is running in.
///
/// Cancellation is cooperative: a handler that never looks at
/// [`is_cancelled`](Self::is_cancelled) runs to completion and its result is
/// discarded.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Execution being run
    pub execution_id: ExecutionId,
    /// Task the execution belongs to
    pub task_id: TaskId,
    /// 1-based attempt number
    pub attempt: u32,
    sink: Option<Arc<dyn ProgressSink>>,
    status: watch::Receiver<TaskStatus>,
    span: (u8, u8),
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .field("span", &self.span)
            .finish()
    }
}

impl ExecutionContext {
    /// Context observing `status` with no progress sink.
    pub fn new(execution_id: ExecutionId, task_id: TaskId, status: watch::Receiver<TaskStatus>) -> Self {
        Self {
            execution_id,
            task_id,
            attempt: 1,
            sink: None,
            status,
            span: (0, 100),
        }
    }

    /// Send progress reports to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set the attempt number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Report progress as a percentage of this context's share of the work.
    pub async fn report_progress(&self, percent: u8) {
        let Some(sink) = &self.sink else {
            return;
        };
        sink.report(self.execution_id, self.scale(percent)).await;
    }

    fn scale(&self, percent: u8) -> u8 {
        let (lo, hi) = self.span;
        let width = u16::from(hi.saturating_sub(lo));
        let scaled = u16::from(lo) + width * u16::from(percent.min(100)) / 100;
        scaled.min(100) as u8
    }

    /// Context for a sub-step covering `lo..hi` percent of this one.
    pub fn child(&self, lo: u8, hi: u8) -> Self {
        let mut child = self.clone();
        child.span = (self.scale(lo), self.scale(hi));
        child
    }

    /// Whether the execution has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.status.borrow() == TaskStatus::Cancelled
    }

    /// Resolve once the execution is cancelled.
    pub async fn cancelled(&self) {
        let mut status = self.status.clone();
        if status.wait_for(|s| *s == TaskStatus::Cancelled).await.is_err() {
            // Sender gone: the execution can no longer be cancelled.
            std::future::pending::<()>().await;
        }
    }
}

/// A caller-supplied unit of work, registered by name for [`TaskKind::Custom`].
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Do the work. An error fails the attempt.
    async fn run(&self, ctx: ExecutionContext, input: Value) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(ExecutionContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, ctx: ExecutionContext, input: Value) -> anyhow::Result<Value> {
        (self.0)(ctx, input).await
    }
}

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(ExecutionContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Remote generation service used by [`TaskKind::Api`].
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Call `operation` on `provider`.
    async fn call(
        &self,
        provider: &str,
        operation: &str,
        params: &Value,
        input: Value,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<Value>;
}

/// Plugin runtime used by [`TaskKind::Plugin`].
#[async_trait]
pub trait PluginHost: Send + Sync {
    /// Invoke `method` on `plugin`.
    async fn invoke(
        &self,
        plugin: &str,
        method: &str,
        params: &Value,
        input: Value,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<Value>;
}

/// Maps each task kind to the collaborator that runs it.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    api: Option<Arc<dyn ApiClient>>,
    plugins: Option<Arc<dyn PluginHost>>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl RunnerRegistry {
    /// Empty registry. Every kind fails until its collaborator is added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the API client.
    pub fn with_api_client(mut self, client: Arc<dyn ApiClient>) -> Self {
        self.api = Some(client);
        self
    }

    /// Attach the plugin host.
    pub fn with_plugin_host(mut self, host: Arc<dyn PluginHost>) -> Self {
        self.plugins = Some(host);
        self
    }

    /// Register a custom handler under `name`.
    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Names of registered custom handlers.
    pub fn handler_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run `kind` with `input`.
    pub fn dispatch<'a>(
        &'a self,
        kind: &'a TaskKind,
        ctx: ExecutionContext,
        input: Value,
    ) -> BoxFuture<'a, anyhow::Result<Value>> {
        async move {
            match kind {
                TaskKind::Api { provider, operation, params } => {
                    let client = self
                        .api
                        .as_ref()
                        .ok_or_else(|| anyhow!("no API client configured for provider '{}'", provider))?;
                    client.call(provider, operation, params, input, &ctx).await
                }
                TaskKind::Plugin { plugin, method, params } => {
                    let host = self
                        .plugins
                        .as_ref()
                        .ok_or_else(|| anyhow!("no plugin host configured for plugin '{}'", plugin))?;
                    host.invoke(plugin, method, params, input, &ctx).await
                }
                TaskKind::Custom { handler } => {
                    let runner = self
                        .handlers
                        .get(handler)
                        .ok_or_else(|| anyhow!("no handler registered as '{}'", handler))?;
                    runner.run(ctx, input).await
                }
                TaskKind::Workflow { steps } => {
                    let total = steps.len();
                    let mut value = input;
                    for (i, step) in steps.iter().enumerate() {
                        if ctx.is_cancelled() {
                            bail!("workflow cancelled before step '{}'", step.name);
                        }

                        let lo = (i * 100 / total) as u8;
                        let hi = ((i + 1) * 100 / total) as u8;
                        debug!("Workflow step {}/{} '{}'", i + 1, total, step.name);

                        let run = self.dispatch(&step.kind, ctx.child(lo, hi), value);
                        value = match step.options.timeout_secs {
                            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), run)
                                .await
                                .map_err(|_| anyhow!("timed out after {}s", secs))
                                .and_then(|r| r),
                            None => run.await,
                        }
                        .with_context(|| format!("workflow step '{}' failed", step.name))?;

                        ctx.report_progress(hi).await;
                    }
                    Ok(value)
                }
            }
        }
        .boxed()
    }
}
