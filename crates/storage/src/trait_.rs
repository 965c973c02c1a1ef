//! Storage trait abstraction.

use async_trait::async_trait;
use relay_core::{
    Execution, ExecutionFilter, ExecutionId, Task, TaskFilter, TaskId, TaskStats, TaskStatus, Time,
};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database backend error
    #[error("Database error: {0}")]
    Database(String),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Statuses a record can be purged in.
pub const TERMINAL_STATUSES: [TaskStatus; 3] =
    [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled];

/// Statuses reported by [`Storage::get_unfinished_tasks`].
pub const UNFINISHED_STATUSES: [TaskStatus; 2] = [TaskStatus::Pending, TaskStatus::Running];

/// The instant `days_old` days before now.
pub fn retention_cutoff(days_old: u32) -> Time {
    chrono::Utc::now() - chrono::Duration::days(i64::from(days_old))
}

/// Durable task and execution records.
///
/// Backends serialize their own mutations, so a single instance can be shared
/// behind an `Arc` by the scheduler and by maintenance callers. Durability is
/// best effort; nothing here is transactional across records.
#[async_trait]
pub trait Storage: Send + Sync {
    // === Task operations ===

    /// Save a task (create or update).
    async fn save_task(&self, task: &Task) -> Result<()>;

    /// Load a task by ID.
    async fn load_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// List tasks matching the filter, oldest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Delete a task. Returns whether it existed.
    async fn delete_task(&self, id: TaskId) -> Result<bool>;

    /// Set a task's status and bump `updated_at`.
    async fn update_task_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        let mut task = self
            .load_task(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("task {}", id)))?;
        task.status = status;
        task.updated_at = chrono::Utc::now();
        self.save_task(&task).await
    }

    // === Execution operations ===

    /// Save an execution (create or update).
    async fn save_execution(&self, execution: &Execution) -> Result<()>;

    /// Load an execution by ID.
    async fn load_execution(&self, id: ExecutionId) -> Result<Option<Execution>>;

    /// List executions matching the filter, oldest first.
    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>>;

    /// Delete an execution. Returns whether it existed.
    async fn delete_execution(&self, id: ExecutionId) -> Result<bool>;

    /// Set an execution's status. Terminal statuses also stamp `end_time`.
    async fn update_execution_status(&self, id: ExecutionId, status: TaskStatus) -> Result<()> {
        let mut execution = self
            .load_execution(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("execution {}", id)))?;
        execution.status = status;
        if status.is_terminal() && execution.end_time.is_none() {
            execution.end_time = Some(chrono::Utc::now());
        }
        self.save_execution(&execution).await
    }

    // === Recovery and maintenance ===

    /// Tasks whose latest status is pending or running.
    async fn get_unfinished_tasks(&self) -> Result<Vec<Task>> {
        self.list_tasks(&TaskFilter::with_status(&UNFINISHED_STATUSES)).await
    }

    /// Delete terminal tasks not updated in the last `days_old` days.
    async fn cleanup_old_tasks(&self, days_old: u32) -> Result<usize> {
        let filter = TaskFilter {
            status: Some(TERMINAL_STATUSES.to_vec()),
            updated_before: Some(retention_cutoff(days_old)),
            ..Default::default()
        };
        let mut removed = 0;
        for task in self.list_tasks(&filter).await? {
            if self.delete_task(task.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete terminal executions that ended more than `days_old` days ago.
    async fn cleanup_old_executions(&self, days_old: u32) -> Result<usize> {
        let filter = ExecutionFilter {
            status: Some(TERMINAL_STATUSES.to_vec()),
            ended_before: Some(retention_cutoff(days_old)),
            ..Default::default()
        };
        let mut removed = 0;
        for execution in self.list_executions(&filter).await? {
            if self.delete_execution(execution.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Task counts by status.
    async fn get_task_stats(&self) -> Result<TaskStats> {
        let tasks = self.list_tasks(&TaskFilter::default()).await?;
        Ok(TaskStats::from_tasks(&tasks))
    }
}
