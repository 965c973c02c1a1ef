//! Task model - the schedulable unit of work.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{ExecutionId, TaskId};
use crate::Time;

/// Lifecycle status shared by tasks and executions.
///
/// Transitions are one-way: `Pending -> Running -> {Completed | Failed | Cancelled}`.
/// A pending execution may also be cancelled directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not yet running
    Pending,
    /// Handler is executing
    Running,
    /// Finished with a result
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Whether no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Lowercase name, as stored.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status or category name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

impl std::str::FromStr for TaskStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseError { kind: "status", value: s.to_string() })
    }
}

/// Admission priority. Used purely as an ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work
    Low,
    /// Default
    #[default]
    Normal,
    /// Ahead of normal work
    High,
    /// Ahead of everything else
    Critical,
}

/// Work category - selects the execution strategy and the admission-control bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    /// Remote generative API call
    Api,
    /// Plugin invocation
    Plugin,
    /// Caller-registered handler
    Custom,
    /// Multi-step sub-workflow
    Workflow,
}

impl TaskCategory {
    /// All categories.
    pub const ALL: [TaskCategory; 4] = [
        TaskCategory::Api,
        TaskCategory::Plugin,
        TaskCategory::Custom,
        TaskCategory::Workflow,
    ];

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Plugin => "plugin",
            Self::Custom => "custom",
            Self::Workflow => "workflow",
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskCategory {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskCategory::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseError { kind: "category", value: s.to_string() })
    }
}

/// What a task does, with the typed configuration for its category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskKind {
    /// Call a remote generation service.
    Api {
        /// Provider name (e.g. an image or audio service)
        provider: String,
        /// Operation on that provider
        operation: String,
        /// Request parameters
        #[serde(default)]
        params: serde_json::Value,
    },
    /// Invoke a method on a loaded plugin.
    Plugin {
        /// Plugin identifier
        plugin: String,
        /// Method to invoke
        method: String,
        /// Call parameters
        #[serde(default)]
        params: serde_json::Value,
    },
    /// Run a handler registered with the scheduler under `handler`.
    Custom {
        /// Registered handler name
        handler: String,
    },
    /// Run `steps` in order, piping each output into the next step.
    Workflow {
        /// Steps of the sub-workflow
        steps: Vec<TaskConfig>,
    },
}

impl TaskKind {
    /// The category this kind is admitted under.
    pub fn category(&self) -> TaskCategory {
        match self {
            Self::Api { .. } => TaskCategory::Api,
            Self::Plugin { .. } => TaskCategory::Plugin,
            Self::Custom { .. } => TaskCategory::Custom,
            Self::Workflow { .. } => TaskCategory::Workflow,
        }
    }
}

fn default_retry_delay() -> u64 {
    1000
}

/// Scheduling metadata attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Admission priority
    #[serde(default)]
    pub priority: Priority,

    /// Per-attempt handler timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Additional attempts after a failure
    #[serde(default)]
    pub max_retries: u32,

    /// Delay between attempts in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            timeout_secs: None,
            max_retries: 0,
            retry_delay_ms: default_retry_delay(),
        }
    }
}

/// Caller-supplied configuration for a new task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// What to run
    pub kind: TaskKind,

    /// Scheduling metadata
    #[serde(default)]
    pub options: TaskOptions,
}

/// Reasons a [`TaskConfig`] is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Name missing or blank
    #[error("task name is required")]
    MissingName,

    /// A category-specific field is blank
    #[error("{category} task is missing `{field}`")]
    MissingField {
        /// Category of the task
        category: TaskCategory,
        /// Name of the blank field
        field: &'static str,
    },

    /// Workflow without steps
    #[error("workflow `{0}` has no steps")]
    EmptyWorkflow(String),

    /// A workflow step is invalid
    #[error("workflow step {index}: {source}")]
    InvalidStep {
        /// Step position
        index: usize,
        /// Underlying error
        #[source]
        source: Box<ConfigError>,
    },
}

impl TaskConfig {
    /// Create a config with default options.
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            description: None,
            kind,
            options: TaskOptions::default(),
        }
    }

    /// Shorthand for a custom-handler task.
    pub fn custom(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::new(name, TaskKind::Custom { handler: handler.into() })
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.options.priority = priority;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.options.timeout_secs = Some(secs);
        self
    }

    /// Set retry behaviour.
    pub fn with_retries(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.options.max_retries = max_retries;
        self.options.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Category of this config.
    pub fn category(&self) -> TaskCategory {
        self.kind.category()
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }

        let category = self.category();
        let blank = |field: &'static str, value: &str| {
            if value.trim().is_empty() {
                Err(ConfigError::MissingField { category, field })
            } else {
                Ok(())
            }
        };

        match &self.kind {
            TaskKind::Api { provider, operation, .. } => {
                blank("provider", provider)?;
                blank("operation", operation)
            }
            TaskKind::Plugin { plugin, method, .. } => {
                blank("plugin", plugin)?;
                blank("method", method)
            }
            TaskKind::Custom { handler } => blank("handler", handler),
            TaskKind::Workflow { steps } => {
                if steps.is_empty() {
                    return Err(ConfigError::EmptyWorkflow(self.name.clone()));
                }
                for (index, step) in steps.iter().enumerate() {
                    step.validate().map_err(|e| ConfigError::InvalidStep {
                        index,
                        source: Box::new(e),
                    })?;
                }
                Ok(())
            }
        }
    }
}

/// A named, configured unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Admission category, derived from `kind`
    pub category: TaskCategory,

    /// Task name
    pub name: String,

    /// Optional description
    pub description: Option<String>,

    /// What to run
    pub kind: TaskKind,

    /// Scheduling metadata
    pub options: TaskOptions,

    /// Mirrors the most recently started execution
    pub status: TaskStatus,

    /// Creation timestamp
    pub created_at: Time,

    /// Last update timestamp
    pub updated_at: Time,

    /// Executions of this task, oldest first
    pub execution_ids: Vec<ExecutionId>,

    /// Execution whose status the task currently mirrors
    #[serde(default)]
    pub active_execution: Option<ExecutionId>,
}

impl Task {
    /// Create a pending task from a config.
    pub fn new(config: TaskConfig) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: TaskId::new(),
            category: config.kind.category(),
            name: config.name,
            description: config.description,
            kind: config.kind,
            options: config.options,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            execution_ids: Vec::new(),
            active_execution: None,
        }
    }

    /// The config this task was created from.
    pub fn config(&self) -> TaskConfig {
        TaskConfig {
            name: self.name.clone(),
            description: self.description.clone(),
            kind: self.kind.clone(),
            options: self.options.clone(),
        }
    }
}

/// Filter for querying tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Filter by status
    pub status: Option<Vec<TaskStatus>>,

    /// Filter by category
    pub category: Option<TaskCategory>,

    /// Only tasks last updated before this instant
    pub updated_before: Option<Time>,

    /// Maximum results to return
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Tasks in any of the given statuses.
    pub fn with_status(statuses: &[TaskStatus]) -> Self {
        Self {
            status: Some(statuses.to_vec()),
            ..Default::default()
        }
    }

    /// Whether `task` passes this filter (ignores `limit`).
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.status {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(category) = self.category {
            if task.category != category {
                return false;
            }
        }
        if let Some(before) = self.updated_before {
            if task.updated_at >= before {
                return false;
            }
        }
        true
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Total number of tasks
    pub total: usize,
    /// Count per status
    pub by_status: HashMap<TaskStatus, usize>,
}

impl TaskStats {
    /// Count tasks.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut stats = Self::default();
        for task in tasks {
            stats.record(task.status);
        }
        stats
    }

    /// Add one task with `status`.
    pub fn record(&mut self, status: TaskStatus) {
        self.total += 1;
        *self.by_status.entry(status).or_insert(0) += 1;
    }

    /// Count for one status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_config() -> TaskConfig {
        TaskConfig::new(
            "thumbnail",
            TaskKind::Api {
                provider: "imagegen".to_string(),
                operation: "generate".to_string(),
                params: serde_json::json!({"prompt": "a lighthouse"}),
            },
        )
    }

    #[test]
    fn test_status_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("RUNNING".parse::<TaskStatus>().unwrap(), TaskStatus::Running);
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_kind_category() {
        assert_eq!(api_config().category(), TaskCategory::Api);
        assert_eq!(TaskConfig::custom("x", "echo").category(), TaskCategory::Custom);
    }

    #[test]
    fn test_validate_rejects_blank_name() {
        let config = TaskConfig::custom("  ", "echo");
        assert_eq!(config.validate(), Err(ConfigError::MissingName));
    }

    #[test]
    fn test_validate_rejects_empty_workflow() {
        let config = TaskConfig::new("pipeline", TaskKind::Workflow { steps: vec![] });
        assert!(matches!(config.validate(), Err(ConfigError::EmptyWorkflow(_))));
    }

    #[test]
    fn test_validate_reports_bad_step() {
        let config = TaskConfig::new(
            "pipeline",
            TaskKind::Workflow {
                steps: vec![api_config(), TaskConfig::custom("second", "")],
            },
        );
        match config.validate() {
            Err(ConfigError::InvalidStep { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let json = r#"{"name": "voice", "kind": {"type": "custom", "handler": "tts"}}"#;
        let config: TaskConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.options, TaskOptions::default());
        assert_eq!(config.category(), TaskCategory::Custom);
    }

    #[test]
    fn test_task_new_is_pending() {
        let task = Task::new(api_config().with_priority(Priority::High));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.category, TaskCategory::Api);
        assert_eq!(task.options.priority, Priority::High);
        assert!(task.execution_ids.is_empty());
        assert_eq!(task.config().name, "thumbnail");
    }

    #[test]
    fn test_filter_matches() {
        let mut task = Task::new(api_config());
        task.status = TaskStatus::Running;

        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter::with_status(&[TaskStatus::Running]).matches(&task));
        assert!(!TaskFilter::with_status(&[TaskStatus::Pending]).matches(&task));

        let filter = TaskFilter {
            category: Some(TaskCategory::Workflow),
            ..Default::default()
        };
        assert!(!filter.matches(&task));
    }

    #[test]
    fn test_stats_counts() {
        let mut done = Task::new(api_config());
        done.status = TaskStatus::Completed;
        let pending = Task::new(api_config());

        let stats = TaskStats::from_tasks([&done, &pending]);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.count(TaskStatus::Completed), 1);
        assert_eq!(stats.count(TaskStatus::Pending), 1);
        assert_eq!(stats.count(TaskStatus::Failed), 0);
    }
}
