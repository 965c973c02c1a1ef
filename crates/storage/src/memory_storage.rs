//! In-memory storage backend.
//!
//! Nothing survives the process. Useful for tests and for running the
//! scheduler without durability.

use std::collections::HashMap;

use async_trait::async_trait;
use relay_core::{Execution, ExecutionFilter, ExecutionId, Task, TaskFilter, TaskId};
use tokio::sync::RwLock;

use super::{Result, Storage};

/// HashMap-backed storage.
#[derive(Default)]
pub struct MemoryStorage {
    tasks: RwLock<HashMap<TaskId, Task>>,
    executions: RwLock<HashMap<ExecutionId, Execution>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_task(&self, task: &Task) -> Result<()> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
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
        Ok(tasks)
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }

    async fn save_execution(&self, execution: &Execution) -> Result<()> {
        self.executions.write().await.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn load_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let mut executions: Vec<Execution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        executions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            executions.truncate(limit);
        }
        Ok(executions)
    }

    async fn delete_execution(&self, id: ExecutionId) -> Result<bool> {
        Ok(self.executions.write().await.remove(&id).is_some())
    }
}
