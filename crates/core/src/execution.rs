//! Execution model - one concrete run of a task.

use serde::{Deserialize, Serialize};

use crate::id::{ExecutionId, TaskId};
use crate::task::TaskStatus;
use crate::Time;

/// One run of a [`Task`](crate::Task) with its own status, progress and outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier
    pub id: ExecutionId,

    /// Owning task
    pub task_id: TaskId,

    /// Current status
    pub status: TaskStatus,

    /// When the execution was created
    pub start_time: Time,

    /// When it reached a terminal status
    pub end_time: Option<Time>,

    /// Progress percentage (0-100)
    pub progress: u8,

    /// Result, set when completed
    pub result: Option<serde_json::Value>,

    /// Error message, set when failed or cancelled
    pub error: Option<String>,

    /// Input the handler was invoked with
    pub input: Option<serde_json::Value>,
}

impl Execution {
    /// Create a pending execution for `task_id`.
    pub fn new(task_id: TaskId, input: Option<serde_json::Value>) -> Self {
        Self {
            id: ExecutionId::new(),
            task_id,
            status: TaskStatus::Pending,
            start_time: chrono::Utc::now(),
            end_time: None,
            progress: 0,
            result: None,
            error: None,
            input,
        }
    }

    /// Whether the execution has finished.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to RUNNING at 0%. Returns false unless currently pending.
    pub fn start(&mut self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Running;
        self.progress = 0;
        true
    }

    /// Record progress. Values are clamped to 100 and never move backwards.
    pub fn advance(&mut self, progress: u8) -> bool {
        let progress = progress.min(100);
        if self.status != TaskStatus::Running || progress <= self.progress {
            return false;
        }
        self.progress = progress;
        true
    }

    /// Move to COMPLETED at 100% with `result`. Returns false if already terminal.
    pub fn complete(&mut self, result: serde_json::Value) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.end_time = Some(chrono::Utc::now());
        true
    }

    /// Move to FAILED with `error`. Returns false if already terminal.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.end_time = Some(chrono::Utc::now());
        true
    }

    /// Move to CANCELLED. Returns false unless pending or running.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.error = Some("cancelled".to_string());
        self.end_time = Some(chrono::Utc::now());
        true
    }
}

/// Filter for querying executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    /// Only executions of this task
    pub task_id: Option<TaskId>,

    /// Filter by status
    pub status: Option<Vec<TaskStatus>>,

    /// Only executions that ended before this instant
    pub ended_before: Option<Time>,

    /// Maximum results to return
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    /// Executions of one task.
    pub fn for_task(task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            ..Default::default()
        }
    }

    /// Whether `execution` passes this filter (ignores `limit`).
    pub fn matches(&self, execution: &Execution) -> bool {
        if let Some(task_id) = self.task_id {
            if execution.task_id != task_id {
                return false;
            }
        }
        if let Some(statuses) = &self.status {
            if !statuses.contains(&execution.status) {
                return false;
            }
        }
        if let Some(before) = self.ended_before {
            match execution.end_time {
                Some(end) if end < before => {}
                _ => return false,
            }
        }
        true
    }
}
