//! Task lifecycle: registration, execution, status and results.
//!
//! The scheduler owns the in-memory registries of tasks and executions.
//! `execute_task` returns as soon as the execution is recorded; the handler
//! runs on a spawned tokio task, optionally behind the concurrency manager.
//! Every state change is mirrored to storage (best effort) and published on
//! the execution's `watch` channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use relay_core::{
    Execution, ExecutionId, Task, TaskConfig, TaskFilter, TaskId, TaskKind, TaskOptions, TaskStatus,
};
use relay_storage::Storage;
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::concurrency::ConcurrencyManager;
use crate::config::SchedulerConfig;
use crate::error::{ExecutionError, Result};
use crate::runner::{ExecutionContext, ProgressSink, RunnerRegistry};

struct ExecutionSlot {
    execution: Execution,
    status: watch::Sender<TaskStatus>,
}

struct Inner {
    config: SchedulerConfig,
    runners: RunnerRegistry,
    concurrency: Option<Arc<ConcurrencyManager>>,
    storage: Option<Arc<dyn Storage>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    executions: RwLock<HashMap<ExecutionId, ExecutionSlot>>,
    // Snapshots are taken under this lock so writes land in state order.
    persist_lock: Mutex<()>,
}

/// Builder for [`TaskScheduler`].
pub struct TaskSchedulerBuilder {
    config: SchedulerConfig,
    runners: RunnerRegistry,
    concurrency: Option<Arc<ConcurrencyManager>>,
    storage: Option<Arc<dyn Storage>>,
}

impl TaskSchedulerBuilder {
    /// Admit executions through `manager`.
    pub fn with_concurrency(mut self, manager: Arc<ConcurrencyManager>) -> Self {
        self.concurrency = Some(manager);
        self
    }

    /// Mirror tasks and executions into `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Override the scheduler settings.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the scheduler.
    pub fn build(self) -> TaskScheduler {
        TaskScheduler {
            inner: Arc::new(Inner {
                config: self.config,
                runners: self.runners,
                concurrency: self.concurrency,
                storage: self.storage,
                tasks: RwLock::new(HashMap::new()),
                executions: RwLock::new(HashMap::new()),
                persist_lock: Mutex::new(()),
            }),
        }
    }
}

/// Creates tasks, runs executions and answers status queries.
///
/// Cheap to clone; clones share the same registries.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    /// Scheduler with no concurrency manager and no storage.
    pub fn new(runners: RunnerRegistry) -> Self {
        Self::builder(runners).build()
    }

    /// Start building a scheduler around `runners`.
    pub fn builder(runners: RunnerRegistry) -> TaskSchedulerBuilder {
        TaskSchedulerBuilder {
            config: SchedulerConfig::default(),
            runners,
            concurrency: None,
            storage: None,
        }
    }

    /// The attached concurrency manager.
    pub fn concurrency(&self) -> Option<&Arc<ConcurrencyManager>> {
        self.inner.concurrency.as_ref()
    }

    /// The attached storage.
    pub fn storage(&self) -> Option<&Arc<dyn Storage>> {
        self.inner.storage.as_ref()
    }

    /// Register a pending task. Does not start it.
    pub async fn create_task(&self, config: TaskConfig) -> Result<TaskId> {
        config.validate()?;

        let task = Task::new(config);
        let id = task.id;
        info!("Created task {} '{}' ({})", id, task.name, task.category);

        self.inner.tasks.write().await.insert(id, task);
        self.inner.persist_task(id).await;
        Ok(id)
    }

    /// Start a new execution of `task_id` and return its id immediately.
    ///
    /// Handler failures never surface here; they are recorded on the
    /// execution.
    pub async fn execute_task(&self, task_id: TaskId, input: Option<Value>) -> Result<ExecutionId> {
        let execution = Execution::new(task_id, input.clone());
        let id = execution.id;

        let (kind, options) = {
            let mut tasks = self.inner.tasks.write().await;
            let task = tasks
                .get_mut(&task_id)
                .ok_or_else(|| ExecutionError::NotFound(format!("task {}", task_id)))?;
            task.execution_ids.push(id);
            task.updated_at = chrono::Utc::now();
            (task.kind.clone(), task.options.clone())
        };

        let (status, _) = watch::channel(TaskStatus::Pending);
        self.inner
            .executions
            .write()
            .await
            .insert(id, ExecutionSlot { execution, status });
        self.inner.persist(id).await;

        info!("Execution {} of task {} submitted", id, task_id);

        let inner = self.inner.clone();
        tokio::spawn(inner.run(id, task_id, kind, options, input.unwrap_or(Value::Null)));

        Ok(id)
    }

    /// Snapshot of an execution.
    pub async fn get_task_status(&self, execution_id: ExecutionId) -> Result<Execution> {
        self.inner
            .executions
            .read()
            .await
            .get(&execution_id)
            .map(|slot| slot.execution.clone())
            .ok_or_else(|| ExecutionError::NotFound(format!("execution {}", execution_id)))
    }

    /// Mark a pending or running execution cancelled.
    ///
    /// A queued execution is withdrawn from the concurrency manager. A running
    /// handler is only signalled through its context; whatever it returns
    /// afterwards is discarded.
    pub async fn cancel_task(&self, execution_id: ExecutionId) -> Result<()> {
        if !self.inner.transition(execution_id, |e| e.cancel()).await {
            let current = self.get_task_status(execution_id).await?;
            return Err(ExecutionError::CancellationConflict {
                id: execution_id.to_string(),
                status: current.status.to_string(),
            });
        }

        if let Some(manager) = &self.inner.concurrency {
            manager.cancel(&execution_id.to_string());
        }
        info!("Execution {} cancelled", execution_id);
        Ok(())
    }

    /// Result of a completed execution.
    pub async fn get_task_results(&self, execution_id: ExecutionId) -> Result<Value> {
        let execution = self.get_task_status(execution_id).await?;
        if execution.status != TaskStatus::Completed {
            return Err(ExecutionError::NotCompleted {
                id: execution_id.to_string(),
                status: execution.status.to_string(),
            });
        }
        Ok(execution.result.unwrap_or(Value::Null))
    }

    /// Snapshot of a task.
    pub async fn get_task(&self, task_id: TaskId) -> Result<Task> {
        self.inner
            .tasks
            .read()
            .await
            .get(&task_id)
            .cloned()
            .ok_or_else(|| ExecutionError::NotFound(format!("task {}", task_id)))
    }

    /// Tasks matching `filter`, oldest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .inner
            .tasks
            .read()
            .await
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();

        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        tasks
    }

    /// Executions of `task_id`, oldest first.
    pub async fn list_executions(&self, task_id: TaskId) -> Result<Vec<Execution>> {
        let ids = self.get_task(task_id).await?.execution_ids;
        let executions = self.inner.executions.read().await;
        let mut list: Vec<Execution> = ids
            .iter()
            .filter_map(|id| executions.get(id))
            .map(|slot| slot.execution.clone())
            .collect();
        list.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    /// Watch an execution's status.
    pub async fn subscribe(&self, execution_id: ExecutionId) -> Result<watch::Receiver<TaskStatus>> {
        self.inner
            .executions
            .read()
            .await
            .get(&execution_id)
            .map(|slot| slot.status.subscribe())
            .ok_or_else(|| ExecutionError::NotFound(format!("execution {}", execution_id)))
    }

    /// Wait until an execution reaches a terminal status.
    pub async fn wait_for_terminal(&self, execution_id: ExecutionId, timeout: Duration) -> Result<Execution> {
        let mut status = self.subscribe(execution_id).await?;
        let reached = tokio::time::timeout(timeout, status.wait_for(|s| s.is_terminal()))
            .await
            .is_ok();
        if !reached {
            return Err(ExecutionError::AdmissionTimeout {
                id: execution_id.to_string(),
                timeout,
            });
        }
        self.get_task_status(execution_id).await
    }

    /// Load unfinished tasks from storage into the registry.
    ///
    /// Handlers are not re-run; callers decide whether to execute the
    /// returned tasks again.
    pub async fn recover(&self) -> Result<Vec<Task>> {
        let Some(storage) = &self.inner.storage else {
            return Ok(Vec::new());
        };

        let unfinished = storage.get_unfinished_tasks().await?;
        let mut tasks = self.inner.tasks.write().await;
        for task in &unfinished {
            tasks.entry(task.id).or_insert_with(|| task.clone());
        }
        info!("Recovered {} unfinished tasks", unfinished.len());
        Ok(unfinished)
    }

    /// Wait for every in-flight execution to finish.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        let pending: Vec<watch::Receiver<TaskStatus>> = self
            .inner
            .executions
            .read()
            .await
            .values()
            .filter(|slot| !slot.execution.is_terminal())
            .map(|slot| slot.status.subscribe())
            .collect();
        info!("Shutting down with {} executions in flight", pending.len());

        for mut status in pending {
            let done = tokio::time::timeout_at(deadline, status.wait_for(|s| s.is_terminal()))
                .await
                .is_ok();
            if !done {
                return Err(ExecutionError::Timeout(timeout));
            }
        }

        if let Some(manager) = &self.inner.concurrency {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            manager.wait_for_all(Some(remaining)).await?;
        }
        Ok(())
    }
}

impl Inner {
    async fn run(
        self: Arc<Self>,
        id: ExecutionId,
        task_id: TaskId,
        kind: TaskKind,
        options: TaskOptions,
        input: Value,
    ) {
        let category = kind.category();
        match (&self.concurrency, self.config.admission_control) {
            (Some(manager), true) => {
                let inner = self.clone();
                let priority = options.priority;
                let admitted = manager
                    .execute(id.to_string(), category, priority, move || {
                        inner.run_admitted(id, task_id, kind, options, input)
                    })
                    .await;
                if let Err(e) = admitted {
                    debug!("Execution {} never admitted: {}", id, e);
                }
            }
            _ => self.clone().run_admitted(id, task_id, kind, options, input).await,
        }
    }

    async fn run_admitted(
        self: Arc<Self>,
        id: ExecutionId,
        task_id: TaskId,
        kind: TaskKind,
        options: TaskOptions,
        input: Value,
    ) {
        if !self.transition(id, |e| e.start()).await {
            debug!("Execution {} no longer pending, not starting", id);
            return;
        }
        let Some(status) = self.status_receiver(id).await else {
            return;
        };
        info!("Execution {} started ({})", id, kind.category());

        let base = ExecutionContext::new(id, task_id, status).with_sink(self.clone() as Arc<dyn ProgressSink>);

        let mut attempt = 1;
        let outcome = loop {
            let ctx = base.clone().with_attempt(attempt);
            let result = self.attempt(&kind, &options, ctx, input.clone()).await;
            if result.is_ok() || attempt > options.max_retries || base.is_cancelled() {
                break result;
            }
            if let Err(e) = &result {
                warn!(
                    "Execution {} attempt {}/{} failed: {:#}; retrying in {}ms",
                    id,
                    attempt,
                    options.max_retries + 1,
                    e,
                    options.retry_delay_ms
                );
            }
            tokio::time::sleep(Duration::from_millis(options.retry_delay_ms)).await;
            if base.is_cancelled() {
                break result;
            }
            attempt += 1;
        };

        match outcome {
            Ok(value) => {
                if self.transition(id, |e| e.complete(value)).await {
                    info!("Execution {} completed", id);
                } else {
                    debug!("Execution {} finished after cancellation, result discarded", id);
                }
            }
            Err(err) => {
                let message = format!("{:#}", err);
                if self.transition(id, |e| e.fail(message.clone())).await {
                    warn!("Execution {} failed: {}", id, message);
                } else {
                    debug!("Execution {} failed after cancellation: {}", id, message);
                }
            }
        }
    }

    /// One handler attempt on its own tokio task, so a panic becomes an error.
    ///
    /// A timed out attempt is aborted and joined before returning, so its
    /// admission slot is never released while the handler still runs.
    async fn attempt(
        self: &Arc<Self>,
        kind: &TaskKind,
        options: &TaskOptions,
        ctx: ExecutionContext,
        input: Value,
    ) -> anyhow::Result<Value> {
        let inner = self.clone();
        let kind = kind.clone();
        let mut handle = tokio::spawn(async move { inner.runners.dispatch(&kind, ctx, input).await });

        let joined = match options.timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    if let Err(e) = handle.await {
                        if !e.is_cancelled() {
                            debug!("Timed out attempt ended abnormally: {}", e);
                        }
                    }
                    return Err(anyhow!("timed out after {}s", secs));
                }
            },
            None => handle.await,
        };
        joined.unwrap_or_else(|e| Err(anyhow!("handler panicked: {}", e)))
    }

    async fn status_receiver(&self, id: ExecutionId) -> Option<watch::Receiver<TaskStatus>> {
        self.executions.read().await.get(&id).map(|slot| slot.status.subscribe())
    }

    /// Apply a one-way transition, mirror it onto the task, persist and publish.
    ///
    /// Returns false if the execution is unknown or `apply` refused.
    async fn transition<F>(&self, id: ExecutionId, apply: F) -> bool
    where
        F: FnOnce(&mut Execution) -> bool,
    {
        {
            let mut executions = self.executions.write().await;
            let Some(slot) = executions.get_mut(&id) else {
                return false;
            };
            if !apply(&mut slot.execution) {
                return false;
            }

            let status = slot.execution.status;
            let mut tasks = self.tasks.write().await;
            if let Some(task) = tasks.get_mut(&slot.execution.task_id) {
                mirror(task, id, status);
            }
        }

        self.persist(id).await;
        self.publish(id).await;
        true
    }

    async fn publish(&self, id: ExecutionId) {
        if let Some(slot) = self.executions.read().await.get(&id) {
            slot.status.send_replace(slot.execution.status);
        }
    }

    fn persistence(&self) -> Option<&Arc<dyn Storage>> {
        self.storage.as_ref().filter(|_| self.config.persist)
    }

    async fn persist_task(&self, task_id: TaskId) {
        let Some(storage) = self.persistence() else {
            return;
        };
        let _order = self.persist_lock.lock().await;
        let task = self.tasks.read().await.get(&task_id).cloned();
        if let Some(task) = task {
            if let Err(e) = storage.save_task(&task).await {
                warn!("Failed to persist task {}: {}", task_id, e);
            }
        }
    }

    async fn persist(&self, id: ExecutionId) {
        let Some(storage) = self.persistence() else {
            return;
        };
        let _order = self.persist_lock.lock().await;
        let Some(execution) = self.executions.read().await.get(&id).map(|slot| slot.execution.clone()) else {
            return;
        };
        let task = self.tasks.read().await.get(&execution.task_id).cloned();

        if let Some(task) = task {
            if let Err(e) = storage.save_task(&task).await {
                warn!("Failed to persist task {}: {}", task.id, e);
            }
        }
        if let Err(e) = storage.save_execution(&execution).await {
            warn!("Failed to persist execution {}: {}", id, e);
        }
    }
}

/// A task follows the execution that most recently started running.
fn mirror(task: &mut Task, id: ExecutionId, status: TaskStatus) {
    match status {
        TaskStatus::Running => {
            task.status = TaskStatus::Running;
            task.active_execution = Some(id);
        }
        s if s.is_terminal() && task.active_execution.map_or(true, |active| active == id) => {
            task.status = s;
        }
        _ => return,
    }
    task.updated_at = chrono::Utc::now();
}

#[async_trait]
impl ProgressSink for Inner {
    async fn report(&self, execution_id: ExecutionId, progress: u8) {
        let advanced = self
            .executions
            .write()
            .await
            .get_mut(&execution_id)
            .map_or(false, |slot| slot.execution.advance(progress));

        if advanced {
            debug!("Execution {} at {}%", execution_id, progress.min(100));
            self.persist(execution_id).await;
        }
    }
}
