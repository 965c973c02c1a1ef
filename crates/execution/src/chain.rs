//! Multi-node chains: dependency-ordered task execution with result passing.
//!
//! A chain is validated and topologically sorted before any task exists. Nodes
//! are then processed one at a time in that order. Each node's task is created
//! and executed through the [`TaskScheduler`], and its result is stored under
//! the node id for later conditions and input transforms. The first node that
//! fails or times out aborts every node after it.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use relay_core::{
    ChainExecution, ChainExecutionId, ChainResults, ChainStatus, ExecutionId, NodeState, NodeStatus,
    TaskConfig, TaskId, TaskStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{ChainConfig, SkippedDependencyPolicy};
use crate::dependency::{DependencyGraph, Resolution};
use crate::error::{ExecutionError, Result};
use crate::scheduler::TaskScheduler;
use crate::waiter::{CompletionWaiter, PollingWaiter};

/// Decides from accumulated results whether a node runs.
pub type Condition = Arc<dyn Fn(&ChainResults) -> bool + Send + Sync>;
/// Computes a node's input from accumulated results.
pub type InputTransform = Arc<dyn Fn(&ChainResults) -> Value + Send + Sync>;
/// Called with `(node_id, result)` when a node completes.
pub type NodeCompleteCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;
/// Called with `(node_id, error)` when a node fails.
pub type NodeErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// Called with every result once the whole chain completes.
pub type ChainCompleteCallback = Arc<dyn Fn(&ChainResults) + Send + Sync>;
/// Called with `(node_id, error)` when the chain fails.
pub type ChainErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// One step of a chain.
#[derive(Clone)]
pub struct ChainNode {
    /// Unique id within the chain; results are keyed by it
    pub id: String,
    /// Display name
    pub name: String,
    /// Task to create and execute for this node
    pub task: TaskConfig,
    /// Nodes that must complete first
    pub depends_on: Vec<String>,
    /// Static input, used when no transform is set
    pub input: Option<Value>,
    condition: Option<Condition>,
    input_transform: Option<InputTransform>,
    on_complete: Option<NodeCompleteCallback>,
    on_error: Option<NodeErrorCallback>,
}

impl fmt::Debug for ChainNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("task", &self.task)
            .field("depends_on", &self.depends_on)
            .field("input", &self.input)
            .field("condition", &self.condition.is_some())
            .field("input_transform", &self.input_transform.is_some())
            .finish()
    }
}

impl ChainNode {
    /// Node `id` running `task`, named after the task.
    pub fn new(id: impl Into<String>, task: TaskConfig) -> Self {
        Self {
            id: id.into(),
            name: task.name.clone(),
            task,
            depends_on: Vec::new(),
            input: None,
            condition: None,
            input_transform: None,
            on_complete: None,
            on_error: None,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add dependencies.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Set a static input.
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    /// Only run when `condition` holds for the results so far.
    pub fn when(mut self, condition: impl Fn(&ChainResults) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Compute the input from the results so far.
    pub fn map_input(mut self, transform: impl Fn(&ChainResults) -> Value + Send + Sync + 'static) -> Self {
        self.input_transform = Some(Arc::new(transform));
        self
    }

    /// Callback on completion.
    pub fn on_complete(mut self, callback: impl Fn(&str, &Value) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    /// Callback on failure.
    pub fn on_error(mut self, callback: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Input for this node given the results so far.
    ///
    /// The transform wins, then the static input. A node with dependencies
    /// and neither gets an object of its dependencies' results.
    pub fn input_for(&self, results: &ChainResults) -> Option<Value> {
        if let Some(transform) = &self.input_transform {
            return Some(transform(results));
        }
        if let Some(input) = &self.input {
            return Some(input.clone());
        }
        if self.depends_on.is_empty() {
            return None;
        }
        let upstream: serde_json::Map<String, Value> = self
            .depends_on
            .iter()
            .filter_map(|dep| results.get(dep).map(|v| (dep.clone(), v.clone())))
            .collect();
        Some(Value::Object(upstream))
    }
}

/// A named set of inter-dependent nodes.
#[derive(Clone, Default)]
pub struct ChainDefinition {
    /// Chain id
    pub id: String,
    /// Display name
    pub name: String,
    /// Nodes, in declaration order
    pub nodes: Vec<ChainNode>,
    on_complete: Option<ChainCompleteCallback>,
    on_error: Option<ChainErrorCallback>,
}

impl fmt::Debug for ChainDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("nodes", &self.nodes)
            .finish()
    }
}

impl ChainDefinition {
    /// Empty chain.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            ..Default::default()
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Append a node.
    pub fn node(mut self, node: ChainNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Callback once every node completed or was skipped.
    pub fn on_complete(mut self, callback: impl Fn(&ChainResults) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    /// Callback when the chain fails.
    pub fn on_error(mut self, callback: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Validate the graph and node tasks, returning the processing order.
    pub fn plan(&self) -> Result<(DependencyGraph, Vec<String>)> {
        let graph = DependencyGraph::new(
            self.nodes
                .iter()
                .map(|n| (n.id.as_str(), n.depends_on.iter().map(String::as_str))),
        )?;
        let order = graph.topological_sort()?;

        for node in &self.nodes {
            node.task
                .validate()
                .map_err(|e| ExecutionError::InvalidConfiguration(format!("node '{}': {}", node.id, e)))?;
        }
        Ok((graph, order))
    }
}

/// Serializable chain description, e.g. read from a JSON file.
///
/// Conditions, transforms and callbacks only exist in code; attach them to
/// the converted [`ChainDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSpec {
    /// Chain id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Nodes
    pub nodes: Vec<NodeSpec>,
}

/// Serializable node description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Task to run
    pub task: TaskConfig,
    /// Dependencies
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Static input
    #[serde(default)]
    pub input: Option<Value>,
}

impl From<NodeSpec> for ChainNode {
    fn from(spec: NodeSpec) -> Self {
        let mut node = ChainNode::new(spec.id, spec.task).depends_on(spec.depends_on);
        if let Some(name) = spec.name {
            node = node.with_name(name);
        }
        node.input = spec.input;
        node
    }
}

impl From<ChainSpec> for ChainDefinition {
    fn from(spec: ChainSpec) -> Self {
        let mut chain = ChainDefinition::new(spec.id);
        if let Some(name) = spec.name {
            chain = chain.with_name(name);
        }
        chain.nodes = spec.nodes.into_iter().map(ChainNode::from).collect();
        chain
    }
}

struct ChainSlot {
    record: ChainExecution,
    status: watch::Sender<ChainStatus>,
}

enum NodeOutcome {
    Continue,
    Abort { node: String, error: String },
    Stopped,
}

/// Runs chains on top of a [`TaskScheduler`].
#[derive(Clone)]
pub struct ChainExecutor {
    scheduler: TaskScheduler,
    waiter: Arc<dyn CompletionWaiter>,
    config: ChainConfig,
    runs: Arc<RwLock<HashMap<ChainExecutionId, ChainSlot>>>,
}

impl ChainExecutor {
    /// Executor that waits on nodes through the scheduler's status channels.
    pub fn new(scheduler: TaskScheduler) -> Self {
        Self {
            waiter: Arc::new(scheduler.clone()),
            scheduler,
            config: ChainConfig::default(),
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Executor that polls node status every `config.poll_interval_ms`.
    pub fn polling(scheduler: TaskScheduler, config: ChainConfig) -> Self {
        let waiter = PollingWaiter::new(scheduler.clone(), config.poll_interval());
        Self::new(scheduler).with_config(config).with_waiter(Arc::new(waiter))
    }

    /// Override the chain settings.
    pub fn with_config(mut self, config: ChainConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a different completion strategy.
    pub fn with_waiter(mut self, waiter: Arc<dyn CompletionWaiter>) -> Self {
        self.waiter = waiter;
        self
    }

    /// The underlying scheduler.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Validate `definition` and start processing it in the background.
    ///
    /// A malformed chain fails here, before any task is created.
    pub async fn execute_chain(&self, definition: ChainDefinition) -> Result<ChainExecutionId> {
        let (graph, order) = definition.plan()?;

        let record = ChainExecution::new(&definition.id, order.iter().map(String::as_str));
        let id = record.id;
        let (status, _) = watch::channel(ChainStatus::Running);
        self.runs.write().await.insert(id, ChainSlot { record, status });

        info!(
            "Chain '{}' run {} started: {}",
            definition.id,
            id,
            order.join(" -> ")
        );

        let executor = self.clone();
        tokio::spawn(async move {
            let joined = tokio::spawn(executor.clone().run(id, definition, graph, order)).await;
            if let Err(e) = joined {
                error!("Chain run {} stopped unexpectedly: {}", id, e);
                executor
                    .update(id, |record| {
                        for state in record.nodes.values_mut() {
                            if matches!(state.status, NodeStatus::Pending | NodeStatus::Running) {
                                state.status = NodeStatus::Cancelled;
                            }
                        }
                        record.finish(ChainStatus::Failed, Some(format!("chain runner stopped: {}", e)))
                    })
                    .await;
            }
        });
        Ok(id)
    }

    /// Snapshot of a chain run.
    pub async fn get_execution(&self, id: ChainExecutionId) -> Result<ChainExecution> {
        self.runs
            .read()
            .await
            .get(&id)
            .map(|slot| slot.record.clone())
            .ok_or_else(|| ExecutionError::NotFound(format!("chain execution {}", id)))
    }

    /// Every chain run, oldest first.
    pub async fn list_executions(&self) -> Vec<ChainExecution> {
        let mut runs: Vec<ChainExecution> = self.runs.read().await.values().map(|s| s.record.clone()).collect();
        runs.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        runs
    }

    /// Forget a finished chain run, returning its final record.
    ///
    /// Runs still in progress are kept and reported as `NotCompleted`.
    pub async fn remove_execution(&self, id: ChainExecutionId) -> Result<ChainExecution> {
        let mut runs = self.runs.write().await;
        let slot = runs
            .get(&id)
            .ok_or_else(|| ExecutionError::NotFound(format!("chain execution {}", id)))?;
        if !slot.record.status.is_terminal() {
            return Err(ExecutionError::NotCompleted {
                id: id.to_string(),
                status: slot.record.status.to_string(),
            });
        }
        let removed = runs.remove(&id).map(|slot| slot.record);
        removed.ok_or_else(|| ExecutionError::NotFound(format!("chain execution {}", id)))
    }

    /// Forget every finished chain run. Returns how many were dropped.
    pub async fn prune_finished(&self) -> usize {
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|_, slot| !slot.record.status.is_terminal());
        let pruned = before - runs.len();
        if pruned > 0 {
            debug!("Pruned {} finished chain runs", pruned);
        }
        pruned
    }

    /// Cancel a running chain.
    ///
    /// Pending nodes never start. Running node executions are cancelled
    /// through the scheduler on a best-effort basis.
    pub async fn cancel_execution(&self, id: ChainExecutionId) -> Result<()> {
        let running: Vec<ExecutionId> = {
            let mut runs = self.runs.write().await;
            let slot = runs
                .get_mut(&id)
                .ok_or_else(|| ExecutionError::NotFound(format!("chain execution {}", id)))?;

            if !slot.record.finish(ChainStatus::Cancelled, Some("cancelled".to_string())) {
                return Err(ExecutionError::CancellationConflict {
                    id: id.to_string(),
                    status: slot.record.status.to_string(),
                });
            }

            let mut running = Vec::new();
            for state in slot.record.nodes.values_mut() {
                match state.status {
                    NodeStatus::Pending => state.status = NodeStatus::Cancelled,
                    NodeStatus::Running => {
                        state.status = NodeStatus::Cancelled;
                        running.extend(state.execution_id);
                    }
                    _ => {}
                }
            }
            slot.status.send_replace(ChainStatus::Cancelled);
            running
        };

        info!("Chain run {} cancelled", id);
        for execution_id in running {
            if let Err(e) = self.scheduler.cancel_task(execution_id).await {
                debug!("Could not cancel node execution {}: {}", execution_id, e);
            }
        }
        Ok(())
    }

    /// Wait until a chain run finishes.
    pub async fn wait_for_chain(&self, id: ChainExecutionId, timeout: Duration) -> Result<ChainExecution> {
        let mut status = {
            let runs = self.runs.read().await;
            let slot = runs
                .get(&id)
                .ok_or_else(|| ExecutionError::NotFound(format!("chain execution {}", id)))?;
            slot.status.subscribe()
        };

        let reached = tokio::time::timeout(timeout, status.wait_for(|s| s.is_terminal()))
            .await
            .is_ok();
        if !reached {
            return Err(ExecutionError::AdmissionTimeout {
                id: id.to_string(),
                timeout,
            });
        }
        self.get_execution(id).await
    }

    async fn run(self, id: ChainExecutionId, definition: ChainDefinition, graph: DependencyGraph, order: Vec<String>) {
        let nodes: HashMap<&str, &ChainNode> = definition.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        for node_id in &order {
            let Some(node) = nodes.get(node_id.as_str()) else {
                continue;
            };
            match self.run_node(id, &graph, node).await {
                NodeOutcome::Continue => {}
                NodeOutcome::Stopped => {
                    debug!("Chain run {} stopped before node '{}' finished", id, node_id);
                    return;
                }
                NodeOutcome::Abort { node, error } => {
                    self.abort(id, &definition, &node, &error).await;
                    return;
                }
            }
        }

        let results = self
            .update(id, |record| {
                record
                    .finish(ChainStatus::Completed, None)
                    .then(|| record.results.clone())
            })
            .await
            .flatten();

        if let Some(results) = results {
            info!("Chain '{}' run {} completed", definition.id, id);
            if let Some(callback) = &definition.on_complete {
                if let Err(e) = guard("chain on_complete callback", || callback(&results)) {
                    error!("Chain '{}' run {}: {}", definition.id, id, e);
                }
            }
        }
    }

    async fn run_node(&self, id: ChainExecutionId, graph: &DependencyGraph, node: &ChainNode) -> NodeOutcome {
        let Ok(snapshot) = self.get_execution(id).await else {
            return NodeOutcome::Stopped;
        };
        if snapshot.status.is_terminal() {
            return NodeOutcome::Stopped;
        }

        let statuses: HashMap<String, NodeStatus> =
            snapshot.nodes.iter().map(|(k, v)| (k.clone(), v.status)).collect();
        match graph.resolve(&node.id, &statuses) {
            Resolution::Ready => {}
            Resolution::Blocked(deps) => {
                self.set_node(id, &node.id, |state| state.status = NodeStatus::Cancelled).await;
                return NodeOutcome::Abort {
                    node: node.id.clone(),
                    error: format!("dependencies of '{}' did not complete: {}", node.id, deps.join(", ")),
                };
            }
            Resolution::Skipped(deps) => match self.config.skipped_dependency {
                SkippedDependencyPolicy::Skip => {
                    info!("Node '{}' skipped: dependencies {} were skipped", node.id, deps.join(", "));
                    self.set_node(id, &node.id, |state| state.status = NodeStatus::Skipped).await;
                    return NodeOutcome::Continue;
                }
                SkippedDependencyPolicy::Abort => {
                    self.set_node(id, &node.id, |state| state.status = NodeStatus::Cancelled).await;
                    return NodeOutcome::Abort {
                        node: node.id.clone(),
                        error: format!("dependencies of '{}' were skipped: {}", node.id, deps.join(", ")),
                    };
                }
            },
        }

        if let Some(condition) = &node.condition {
            match guard("condition", || condition(&snapshot.results)) {
                Ok(true) => {}
                Ok(false) => {
                    info!("Node '{}' skipped: condition not met", node.id);
                    self.set_node(id, &node.id, |state| state.status = NodeStatus::Skipped).await;
                    return NodeOutcome::Continue;
                }
                Err(error) => return self.fail_node(id, node, error).await,
            }
        }

        let input = match guard("input transform", || node.input_for(&snapshot.results)) {
            Ok(input) => input,
            Err(error) => return self.fail_node(id, node, error).await,
        };
        let (task_id, execution_id) = match self.start_node(node, input).await {
            Ok(ids) => ids,
            Err(e) => return self.fail_node(id, node, e.to_string()).await,
        };

        // Record the execution; a chain cancelled in the meantime takes it down too.
        let chain_live = self
            .update(id, |record| {
                if let Some(state) = record.nodes.get_mut(&node.id) {
                    state.execution_id = Some(execution_id);
                    state.task_id = Some(task_id);
                    if !record.status.is_terminal() {
                        state.status = NodeStatus::Running;
                    }
                }
                !record.status.is_terminal()
            })
            .await
            .unwrap_or(false);
        if !chain_live {
            if let Err(e) = self.scheduler.cancel_task(execution_id).await {
                debug!("Could not cancel node execution {}: {}", execution_id, e);
            }
            return NodeOutcome::Stopped;
        }
        info!("Node '{}' running as execution {}", node.id, execution_id);

        let waited = self
            .waiter
            .wait_for_terminal(execution_id, self.config.node_timeout())
            .await;

        let error = match waited {
            Ok(execution) if execution.status == TaskStatus::Completed => {
                let result = execution.result.unwrap_or(Value::Null);
                let recorded = self
                    .update(id, |record| {
                        if record.status.is_terminal() {
                            return false;
                        }
                        record.results.insert(node.id.clone(), result.clone());
                        if let Some(state) = record.nodes.get_mut(&node.id) {
                            state.status = NodeStatus::Completed;
                            state.result = Some(result.clone());
                        }
                        true
                    })
                    .await
                    .unwrap_or(false);
                if !recorded {
                    return NodeOutcome::Stopped;
                }

                info!("Node '{}' completed", node.id);
                if let Some(callback) = &node.on_complete {
                    if let Err(error) = guard("on_complete callback", || callback(&node.id, &result)) {
                        warn!("Node '{}': {}", node.id, error);
                        return NodeOutcome::Abort { node: node.id.clone(), error };
                    }
                }
                return NodeOutcome::Continue;
            }
            Ok(execution) => execution
                .error
                .unwrap_or_else(|| format!("execution ended {}", execution.status)),
            Err(ExecutionError::AdmissionTimeout { timeout, .. }) => {
                if let Err(e) = self.scheduler.cancel_task(execution_id).await {
                    debug!("Could not cancel timed out execution {}: {}", execution_id, e);
                }
                format!("timed out after {:?}", timeout)
            }
            Err(e) => e.to_string(),
        };

        let failed = self
            .update(id, |record| {
                let live = !record.status.is_terminal();
                if let Some(state) = record.nodes.get_mut(&node.id) {
                    state.status = if live { NodeStatus::Failed } else { NodeStatus::Cancelled };
                    state.error = Some(error.clone());
                }
                live
            })
            .await
            .unwrap_or(false);
        if !failed {
            return NodeOutcome::Stopped;
        }

        self.report_failure(node, error)
    }

    /// Mark a node that never got a running execution as failed.
    async fn fail_node(&self, id: ChainExecutionId, node: &ChainNode, error: String) -> NodeOutcome {
        self.set_node(id, &node.id, |state| {
            state.status = NodeStatus::Failed;
            state.error = Some(error.clone());
        })
        .await;
        self.report_failure(node, error)
    }

    fn report_failure(&self, node: &ChainNode, error: String) -> NodeOutcome {
        warn!("Node '{}' failed: {}", node.id, error);
        if let Some(callback) = &node.on_error {
            if let Err(e) = guard("on_error callback", || callback(&node.id, &error)) {
                error!("Node '{}': {}", node.id, e);
            }
        }
        NodeOutcome::Abort { node: node.id.clone(), error }
    }

    async fn start_node(&self, node: &ChainNode, input: Option<Value>) -> Result<(TaskId, ExecutionId)> {
        let task_id = self.scheduler.create_task(node.task.clone()).await?;
        let execution_id = self.scheduler.execute_task(task_id, input).await?;
        Ok((task_id, execution_id))
    }

    async fn abort(&self, id: ChainExecutionId, definition: &ChainDefinition, node: &str, error: &str) {
        let message = format!("node '{}' failed: {}", node, error);
        let finished = self
            .update(id, |record| {
                for state in record.nodes.values_mut() {
                    if state.status == NodeStatus::Pending {
                        state.status = NodeStatus::Cancelled;
                    }
                }
                record.finish(ChainStatus::Failed, Some(message.clone()))
            })
            .await
            .unwrap_or(false);

        if finished {
            warn!("Chain '{}' run {} failed: {}", definition.id, id, message);
            if let Some(callback) = &definition.on_error {
                if let Err(e) = guard("chain on_error callback", || callback(node, error)) {
                    error!("Chain '{}' run {}: {}", definition.id, id, e);
                }
            }
        }
    }

    async fn set_node(&self, id: ChainExecutionId, node_id: &str, apply: impl FnOnce(&mut NodeState)) {
        self.update(id, |record| {
            if let Some(state) = record.nodes.get_mut(node_id) {
                apply(state);
            }
        })
        .await;
    }

    /// Mutate a run's record and publish its status.
    async fn update<R>(&self, id: ChainExecutionId, apply: impl FnOnce(&mut ChainExecution) -> R) -> Option<R> {
        let mut runs = self.runs.write().await;
        let slot = runs.get_mut(&id)?;
        let out = apply(&mut slot.record);
        slot.status.send_replace(slot.record.status);
        Some(out)
    }
}

/// Run user code, turning a panic into an error message.
fn guard<R>(what: &str, f: impl FnOnce() -> R) -> std::result::Result<R, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        format!("{} panicked: {}", what, reason)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{handler_fn, RunnerRegistry};
    use relay_core::TaskFilter;
    use serde_json::json;

    fn executor() -> ChainExecutor {
        let runners = RunnerRegistry::new().register("echo", handler_fn(|_ctx, input| async move { Ok(input) }));
        ChainExecutor::new(TaskScheduler::new(runners))
    }

    #[test]
    fn test_input_precedence() {
        let results: ChainResults = HashMap::from([("a".to_string(), json!(1)), ("b".to_string(), json!(2))]);

        let plain = ChainNode::new("x", TaskConfig::custom("x", "echo"));
        assert_eq!(plain.input_for(&results), None);

        let fan_in = plain.clone().depends_on(["a", "b"]);
        assert_eq!(fan_in.input_for(&results), Some(json!({"a": 1, "b": 2})));

        let fixed = fan_in.clone().with_input(json!("static"));
        assert_eq!(fixed.input_for(&results), Some(json!("static")));

        let mapped = fixed.map_input(|r| json!(r["a"].as_i64().unwrap_or(0) * 10));
        assert_eq!(mapped.input_for(&results), Some(json!(10)));
    }

    #[test]
    fn test_json_chain_conversion() {
        let json = r#"{
            "id": "poster",
            "nodes": [
                {"id": "prompt", "task": {"name": "prompt", "kind": {"type": "custom", "handler": "echo"}},
                 "input": {"text": "a lighthouse"}},
                {"id": "render", "name": "Render image",
                 "task": {"name": "render", "kind": {"type": "custom", "handler": "echo"},
                          "options": {"priority": "high"}},
                 "depends_on": ["prompt"]}
            ]
        }"#;
        let spec: ChainSpec = serde_json::from_str(json).unwrap();
        let chain = ChainDefinition::from(spec);

        assert_eq!(chain.name, "poster");
        assert_eq!(chain.nodes.len(), 2);
        assert_eq!(chain.nodes[0].input, Some(json!({"text": "a lighthouse"})));
        assert_eq!(chain.nodes[1].name, "Render image");
        assert_eq!(chain.nodes[1].depends_on, vec!["prompt"]);

        let (_, order) = chain.plan().unwrap();
        assert_eq!(order, vec!["prompt", "render"]);
    }

    #[tokio::test]
    async fn test_cycle_creates_no_tasks() {
        let executor = executor();
        let chain = ChainDefinition::new("loop")
            .node(ChainNode::new("a", TaskConfig::custom("a", "echo")).depends_on(["b"]))
            .node(ChainNode::new("b", TaskConfig::custom("b", "echo")).depends_on(["a"]));

        let err = executor.execute_chain(chain).await.unwrap_err();
        assert!(matches!(err, ExecutionError::CircularDependency(_)));
        assert!(executor.scheduler().list_tasks(&TaskFilter::default()).await.is_empty());
        assert!(executor.list_executions().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_node_task_is_rejected_up_front() {
        let executor = executor();
        let chain = ChainDefinition::new("bad")
            .node(ChainNode::new("ok", TaskConfig::custom("ok", "echo")))
            .node(ChainNode::new("broken", TaskConfig::custom("", "echo")).depends_on(["ok"]));

        let err = executor.execute_chain(chain).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert!(executor.scheduler().list_tasks(&TaskFilter::default()).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let executor = executor();
        let id = ChainExecutionId::new();
        assert!(matches!(executor.get_execution(id).await, Err(ExecutionError::NotFound(_))));
        assert!(matches!(executor.cancel_execution(id).await, Err(ExecutionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fan_in_results() {
        let executor = executor();
        let chain = ChainDefinition::new("fan-in")
            .node(ChainNode::new("left", TaskConfig::custom("left", "echo")).with_input(json!("L")))
            .node(ChainNode::new("right", TaskConfig::custom("right", "echo")).with_input(json!("R")))
            .node(ChainNode::new("join", TaskConfig::custom("join", "echo")).depends_on(["left", "right"]));

        let id = executor.execute_chain(chain).await.unwrap();
        let run = executor.wait_for_chain(id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(run.status, ChainStatus::Completed);
        assert_eq!(run.results["join"], json!({"left": "L", "right": "R"}));
        assert!(run.end_time.is_some());
        for state in run.nodes.values() {
            assert_eq!(state.status, NodeStatus::Completed);
            assert!(state.task_id.is_some());
        }
    }

    #[test]
    fn test_guard_reports_panic_message() {
        assert_eq!(guard("condition", || 7), Ok(7));
        let err = guard("condition", || -> bool { panic!("bad results") }).unwrap_err();
        assert_eq!(err, "condition panicked: bad results");
    }

    #[tokio::test]
    async fn test_remove_and_prune_finished_runs() {
        let runners = RunnerRegistry::new()
            .register("echo", handler_fn(|_ctx, input| async move { Ok(input) }))
            .register(
                "hang",
                handler_fn(|ctx, _input| async move {
                    ctx.cancelled().await;
                    Ok(Value::Null)
                }),
            );
        let executor = ChainExecutor::new(TaskScheduler::new(runners));

        let done = executor
            .execute_chain(ChainDefinition::new("quick").node(ChainNode::new("a", TaskConfig::custom("a", "echo"))))
            .await
            .unwrap();
        executor.wait_for_chain(done, Duration::from_secs(5)).await.unwrap();
        let stuck = executor
            .execute_chain(ChainDefinition::new("slow").node(ChainNode::new("h", TaskConfig::custom("h", "hang"))))
            .await
            .unwrap();

        assert!(matches!(
            executor.remove_execution(stuck).await,
            Err(ExecutionError::NotCompleted { .. })
        ));
        let removed = executor.remove_execution(done).await.unwrap();
        assert_eq!(removed.status, ChainStatus::Completed);
        assert!(matches!(executor.get_execution(done).await, Err(ExecutionError::NotFound(_))));

        assert_eq!(executor.prune_finished().await, 0);
        executor.cancel_execution(stuck).await.unwrap();
        assert_eq!(executor.prune_finished().await, 1);
        assert!(executor.list_executions().await.is_empty());
    }
}
