//! SQLite storage backend for relay.
//!
//! Records are stored as JSON documents next to the indexed columns the
//! filters need (status, category, timestamps), so retention and recovery
//! queries run in SQL.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::SecondsFormat;
use relay_core::{
    Execution, ExecutionFilter, ExecutionId, Task, TaskFilter, TaskId, TaskStats, TaskStatus, Time,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::warn;

use super::trait_::{retention_cutoff, Result, Storage, StorageError, TERMINAL_STATUSES};

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    /// Database connection pool
    pool: sqlx::SqlitePool,
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

/// Fixed-width UTC timestamps so lexical order matches time order.
fn ts(time: Time) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqliteStorage {
    /// Open (or create) a database at `db_url`, e.g. `sqlite://relay.db`.
    pub async fn new(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .map_err(db_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Create an in-memory SQLite storage for testing.
    pub async fn in_memory() -> Result<Self> {
        // A single connection: every pooled connection would otherwise get its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                category TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            "CREATE INDEX IF NOT EXISTS idx_executions_task ON executions(task_id)",
            "CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status)",
        ] {
            sqlx::query(index).execute(&self.pool).await.map_err(db_err)?;
        }

        Ok(())
    }

    /// Check if the database is healthy.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    fn decode_rows<T: serde::de::DeserializeOwned>(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<T>> {
        rows.into_iter()
            .map(|row| {
                let data: String = row.try_get("data").map_err(db_err)?;
                serde_json::from_str(&data).map_err(StorageError::from)
            })
            .collect()
    }
}

fn push_status_filter(qb: &mut QueryBuilder<'_, Sqlite>, statuses: &[TaskStatus]) {
    if statuses.is_empty() {
        qb.push(" AND 0");
        return;
    }
    qb.push(" AND status IN (");
    let mut separated = qb.separated(", ");
    for status in statuses {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl Storage for SqliteStorage {
    // === Task operations ===

    async fn save_task(&self, task: &Task) -> Result<()> {
        let data = serde_json::to_string(task)?;

        sqlx::query(
            "INSERT OR REPLACE INTO tasks (id, status, category, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(task.status.as_str())
        .bind(task.category.as_str())
        .bind(data)
        .bind(ts(task.created_at))
        .bind(ts(task.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn load_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT data FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(Self::decode_rows(row.into_iter().collect())?.pop())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT data FROM tasks WHERE 1 = 1");
        if let Some(statuses) = &filter.status {
            push_status_filter(&mut qb, statuses);
        }
        if let Some(category) = filter.category {
            qb.push(" AND category = ").push_bind(category.as_str());
        }
        if let Some(before) = filter.updated_before {
            qb.push(" AND updated_at < ").push_bind(ts(before));
        }
        qb.push(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        Self::decode_rows(rows)
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    // === Execution operations ===

    async fn save_execution(&self, execution: &Execution) -> Result<()> {
        let data = serde_json::to_string(execution)?;

        sqlx::query(
            "INSERT OR REPLACE INTO executions (id, task_id, status, data, start_time, end_time)
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(execution.id.to_string())
        .bind(execution.task_id.to_string())
        .bind(execution.status.as_str())
        .bind(data)
        .bind(ts(execution.start_time))
        .bind(execution.end_time.map(ts))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn load_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT data FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(Self::decode_rows(row.into_iter().collect())?.pop())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT data FROM executions WHERE 1 = 1");
        if let Some(task_id) = filter.task_id {
            qb.push(" AND task_id = ").push_bind(task_id.to_string());
        }
        if let Some(statuses) = &filter.status {
            push_status_filter(&mut qb, statuses);
        }
        if let Some(before) = filter.ended_before {
            qb.push(" AND end_time IS NOT NULL AND end_time < ").push_bind(ts(before));
        }
        qb.push(" ORDER BY start_time ASC, id ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        Self::decode_rows(rows)
    }

    async fn delete_execution(&self, id: ExecutionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    // === Recovery and maintenance ===

    async fn cleanup_old_tasks(&self, days_old: u32) -> Result<usize> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM tasks WHERE 1 = 1");
        push_status_filter(&mut qb, &TERMINAL_STATUSES);
        qb.push(" AND updated_at < ").push_bind(ts(retention_cutoff(days_old)));

        let result = qb.build().execute(&self.pool).await.map_err(db_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn cleanup_old_executions(&self, days_old: u32) -> Result<usize> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM executions WHERE 1 = 1");
        push_status_filter(&mut qb, &TERMINAL_STATUSES);
        qb.push(" AND end_time IS NOT NULL AND end_time < ")
            .push_bind(ts(retention_cutoff(days_old)));

        let result = qb.build().execute(&self.pool).await.map_err(db_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn get_task_stats(&self) -> Result<TaskStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut stats = TaskStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(db_err)?;
            let count: i64 = row.try_get("count").map_err(db_err)?;
            match status.parse::<TaskStatus>() {
                Ok(status) => {
                    stats.total += count as usize;
                    stats.by_status.insert(status, count as usize);
                }
                Err(e) => warn!("Ignoring tasks with {}", e),
            }
        }
        Ok(stats)
    }
}
