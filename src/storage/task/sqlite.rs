use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::TaskStorage;
use crate::schedule::types::{StatusUpdate, Task, TaskStatus, TaskType};

pub struct SqliteTaskStorage {
    pool: SqlitePool,
}

/// Fixed-width UTC text so string order is time order.
fn to_db_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc))
}

impl SqliteTaskStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Initializing SQLite task storage at {}", database_url);
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    /// A private in-memory database, used by tests and local runs.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // every connection to :memory: is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                input_ref TEXT NOT NULL,
                params TEXT NOT NULL,
                result_ref TEXT,
                error TEXT,
                file_size INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status_completed ON tasks (status, completed_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn row_to_task(row: SqliteRow) -> Result<Task> {
        let task_type: String = row.try_get("task_type")?;
        let status: String = row.try_get("status")?;
        let params: String = row.try_get("params")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        let completed_at: Option<String> = row.try_get("completed_at")?;
        let file_size: Option<i64> = row.try_get("file_size")?;

        Ok(Task {
            id: row.try_get("id")?,
            task_type: TaskType::from_str(&task_type).map_err(|e| anyhow::anyhow!(e))?,
            status: TaskStatus::try_from(status).map_err(|e| anyhow::anyhow!(e))?,
            input_ref: row.try_get("input_ref")?,
            params: serde_json::from_str(&params)?,
            result_ref: row.try_get("result_ref")?,
            error: row.try_get("error")?,
            file_size: file_size.map(|size| size as u64),
            created_at: from_db_time(&created_at)?,
            updated_at: from_db_time(&updated_at)?,
            completed_at: completed_at.as_deref().map(from_db_time).transpose()?,
        })
    }
}

#[async_trait]
impl TaskStorage for SqliteTaskStorage {
    async fn insert(&self, task: &Task) -> Result<()> {
        let params = serde_json::to_string(&task.params)?;

        sqlx::query(
            r#"
            INSERT INTO tasks
            (id, task_type, status, input_ref, params, result_ref, error, file_size, created_at, updated_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(&task.input_ref)
        .bind(params)
        .bind(&task.result_ref)
        .bind(&task.error)
        .bind(task.file_size.map(|size| size as i64))
        .bind(to_db_time(task.created_at))
        .bind(to_db_time(task.updated_at))
        .bind(task.completed_at.map(to_db_time))
        .execute(&self.pool)
        .await?;

        debug!("Inserted task {}", task.id);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_task).transpose()
    }

    async fn transition(&self, task_id: &str, update: StatusUpdate) -> Result<()> {
        let target = update.status();
        let predecessors = target.predecessors();
        if predecessors.is_empty() {
            return Err(anyhow::anyhow!("No transition leads to {}", target));
        }

        let now = to_db_time(Utc::now());
        let placeholders = vec!["?"; predecessors.len()].join(", ");

        let sql = match &update {
            StatusUpdate::Running => "UPDATE tasks SET status = ?, updated_at = ?".to_string(),
            StatusUpdate::Success { .. } => {
                "UPDATE tasks SET status = ?, updated_at = ?, result_ref = ?, file_size = ?, completed_at = ?".to_string()
            }
            StatusUpdate::Failed { .. } => {
                "UPDATE tasks SET status = ?, updated_at = ?, error = ?, completed_at = ?".to_string()
            }
        };
        let sql = format!("{} WHERE id = ? AND status IN ({})", sql, placeholders);

        let mut query = sqlx::query(&sql).bind(target.as_str()).bind(&now);
        query = match &update {
            StatusUpdate::Running => query,
            StatusUpdate::Success { result_ref, file_size } => {
                query.bind(result_ref.as_str()).bind(*file_size as i64).bind(&now)
            }
            StatusUpdate::Failed { error } => query.bind(error.as_str()).bind(&now),
        };
        query = query.bind(task_id);
        for status in predecessors {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!(
                "Task {} cannot move to {}: missing or not in {:?}",
                task_id,
                target,
                predecessors
            ));
        }

        debug!("Task {} is now {}", task_id, target);
        Ok(())
    }

    async fn list_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE status IN (?, ?)
            AND completed_at IS NOT NULL
            AND completed_at <= ?
            ORDER BY completed_at ASC
            "#,
        )
        .bind(TaskStatus::Success.as_str())
        .bind(TaskStatus::Failed.as_str())
        .bind(to_db_time(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_task).collect()
    }

    async fn delete(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
