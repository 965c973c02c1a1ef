//! JSON file storage implementation.
//!
//! Stores one JSON file per record under `tasks/` and `executions/`. Writes
//! go to a temporary file first and are renamed into place, so a crash
//! mid-write leaves the previous snapshot intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use relay_core::{Execution, ExecutionFilter, ExecutionId, Task, TaskFilter, TaskId};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Result, Storage};

/// File-based JSON storage backend.
pub struct JsonStorage {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStorage {
    /// Create storage rooted at `root`, creating the record directories.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("tasks")).await?;
        fs::create_dir_all(root.join("executions")).await?;

        debug!("Opened JSON storage at {}", root.display());

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_path(&self, id: TaskId) -> PathBuf {
        self.root.join("tasks").join(format!("{}.json", id))
    }

    fn execution_path(&self, id: ExecutionId) -> PathBuf {
        self.root.join("executions").join(format!("{}.json", id))
    }

    async fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");

        let _guard = self.write_lock.lock().await;
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Storage for JsonStorage {
    async fn save_task(&self, task: &Task) -> Result<()> {
        self.write_json(&self.task_path(task.id), task).await
    }

    async fn load_task(&self, id: TaskId) -> Result<Option<Task>> {
        read_json(&self.task_path(id)).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = list_dir(&self.root.join("tasks"))
            .await?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();

        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool> {
        self.remove(&self.task_path(id)).await
    }

    async fn save_execution(&self, execution: &Execution) -> Result<()> {
        self.write_json(&self.execution_path(execution.id), execution).await
    }

    async fn load_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        read_json(&self.execution_path(id)).await
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let mut executions: Vec<Execution> = list_dir(&self.root.join("executions"))
            .await?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();

        executions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            executions.truncate(limit);
        }
        Ok(executions)
    }

    async fn delete_execution(&self, id: ExecutionId) -> Result<bool> {
        self.remove(&self.execution_path(id)).await
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match read_json(&path).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{TaskConfig, TaskStatus};

    fn task_with(status: TaskStatus, age_days: i64) -> Task {
        let mut task = Task::new(TaskConfig::custom("render", "echo"));
        let at = chrono::Utc::now() - chrono::Duration::days(age_days);
        task.status = status;
        task.created_at = at;
        task.updated_at = at;
        task
    }

    #[tokio::test]
    async fn test_task_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();

        let task = task_with(TaskStatus::Pending, 0);
        storage.save_task(&task).await.unwrap();

        let loaded = storage.load_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "render");
        assert!(storage.load_task(TaskId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_with(TaskStatus::Running, 0);
        let execution = Execution::new(task.id, None);

        {
            let storage = JsonStorage::new(dir.path()).await.unwrap();
            storage.save_task(&task).await.unwrap();
            storage.save_execution(&execution).await.unwrap();
        }

        let reopened = JsonStorage::new(dir.path()).await.unwrap();
        let unfinished = reopened.get_unfinished_tasks().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, task.id);

        let executions = reopened
            .list_executions(&ExecutionFilter::for_task(task.id))
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
    }

    #[tokio::test]
    async fn test_update_status() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        let task = task_with(TaskStatus::Pending, 0);
        storage.save_task(&task).await.unwrap();

        storage.update_task_status(task.id, TaskStatus::Failed).await.unwrap();
        let loaded = storage.load_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);

        let missing = storage.update_task_status(TaskId::new(), TaskStatus::Failed).await;
        assert!(matches!(missing, Err(crate::StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cleanup_old_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();

        let old_done = task_with(TaskStatus::Completed, 40);
        let old_pending = task_with(TaskStatus::Pending, 40);
        let old_running = task_with(TaskStatus::Running, 40);
        let young_failed = task_with(TaskStatus::Failed, 5);
        for task in [&old_done, &old_pending, &old_running, &young_failed] {
            storage.save_task(task).await.unwrap();
        }

        let removed = storage.cleanup_old_tasks(30).await.unwrap();
        assert_eq!(removed, 1);
        assert!(storage.load_task(old_done.id).await.unwrap().is_none());
        assert!(storage.load_task(old_pending.id).await.unwrap().is_some());
        assert!(storage.load_task(old_running.id).await.unwrap().is_some());
        assert!(storage.load_task(young_failed.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        storage.save_task(&task_with(TaskStatus::Pending, 0)).await.unwrap();

        tokio::fs::write(dir.path().join("tasks").join("notes.txt"), b"hello").await.unwrap();
        tokio::fs::write(dir.path().join("tasks").join("broken.json"), b"{").await.unwrap();

        let tasks = storage.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        let task = task_with(TaskStatus::Completed, 0);
        storage.save_task(&task).await.unwrap();

        assert!(storage.delete_task(task.id).await.unwrap());
        assert!(!storage.delete_task(task.id).await.unwrap());
    }
}
