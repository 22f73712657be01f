use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::BackendError;
use crate::task::{StatusFilter, Task, TaskStatus, TaskUpdate};

use super::Storage;

/// One row per task in a configurable table (`tasks` by default), indexed
/// on `(status, priority DESC, created_at ASC)`. Dequeue runs
/// `SELECT ... FOR UPDATE SKIP LOCKED` inside a transaction — the atomicity
/// primitive that lets concurrent workers dequeue without serializing on
/// each other, grounded directly on `hook_common::pgqueue::PgQueue::dequeue`
/// and `cyclotron_core::ops::worker::dequeue_jobs`.
pub struct SqlStorage {
    pool: PgPool,
    table: String,
}

impl SqlStorage {
    pub async fn new(config: &PoolConfig, table_name: Option<&str>) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .max_lifetime(config.max_lifetime)
            .idle_timeout(config.idle_timeout)
            .connect(&config.database_url)
            .await?;

        Ok(Self {
            pool,
            table: table_name.unwrap_or("tasks").to_string(),
        })
    }

    pub fn from_pool(pool: PgPool, table_name: impl Into<String>) -> Self {
        Self {
            pool,
            table: table_name.into(),
        }
    }

    /// Idempotently create the table and its indexes. Safe to call on every
    /// startup.
    pub async fn migrate(&self) -> Result<(), BackendError> {
        let create_type = format!(
            r#"DO $$ BEGIN
                CREATE TYPE task_status AS ENUM ('pending', 'processing', 'done', 'failed', 'deleted');
            EXCEPTION WHEN duplicate_object THEN null;
            END $$;"#
        );
        sqlx::query(&create_type).execute(&self.pool).await?;

        let create_table = format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
                id UUID PRIMARY KEY,
                handler TEXT NOT NULL,
                payload JSONB NOT NULL,
                status task_status NOT NULL,
                priority INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                max_retries INTEGER NOT NULL,
                max_processing_time_ms BIGINT NOT NULL,
                retry_count INTEGER NOT NULL,
                log TEXT,
                reclaim_count INTEGER NOT NULL DEFAULT 0
            )"#,
            table = self.table
        );
        sqlx::query(&create_table).execute(&self.pool).await?;

        let create_index = format!(
            r#"CREATE INDEX IF NOT EXISTS "{table}_status_priority_idx"
                ON "{table}" (status, priority DESC, created_at ASC)"#,
            table = self.table
        );
        sqlx::query(&create_index).execute(&self.pool).await?;

        let create_status_index = format!(
            r#"CREATE INDEX IF NOT EXISTS "{table}_status_idx" ON "{table}" (status)"#,
            table = self.table
        );
        sqlx::query(&create_status_index).execute(&self.pool).await?;

        Ok(())
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task, BackendError> {
        let status_str: String = row.try_get("status")?;
        let status = match status_str.as_str() {
            "pending" => TaskStatus::Pending,
            "processing" => TaskStatus::Processing,
            "done" => TaskStatus::Done,
            "failed" => TaskStatus::Failed,
            "deleted" => TaskStatus::Deleted,
            other => {
                return Err(BackendError::Serialization(format!(
                    "unknown task_status {:?} read from storage",
                    other
                )))
            }
        };

        let max_processing_time_ms: i64 = row.try_get("max_processing_time_ms")?;

        Ok(Task {
            id: row.try_get("id")?,
            handler: row.try_get("handler")?,
            payload: row.try_get("payload")?,
            status,
            priority: row.try_get("priority")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            max_retries: row.try_get::<i32, _>("max_retries")? as u32,
            max_processing_time: std::time::Duration::from_millis(max_processing_time_ms as u64),
            retry_count: row.try_get::<i32, _>("retry_count")? as u32,
            log: row.try_get("log")?,
            reclaim_count: row.try_get::<i32, _>("reclaim_count")? as u32,
        })
    }
}

#[async_trait]
impl Storage for SqlStorage {
    async fn enqueue(&self, task: Task) -> Result<(), BackendError> {
        let query = format!(
            r#"INSERT INTO "{table}"
                (id, handler, payload, status, priority, created_at, updated_at,
                 max_retries, max_processing_time_ms, retry_count, log, reclaim_count)
               VALUES ($1, $2, $3, $4::task_status, $5, $6, $7, $8, $9, $10, $11, $12)"#,
            table = self.table
        );

        sqlx::query(&query)
            .bind(task.id)
            .bind(task.handler)
            .bind(task.payload)
            .bind(task.status.to_string())
            .bind(task.priority)
            .bind(task.created_at)
            .bind(task.updated_at)
            .bind(task.max_retries as i32)
            .bind(task.max_processing_time.as_millis() as i64)
            .bind(task.retry_count as i32)
            .bind(task.log)
            .bind(task.reclaim_count as i32)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Task>, BackendError> {
        let mut tx = self.pool.begin().await?;

        let select = format!(
            r#"SELECT * FROM "{table}"
               WHERE status = 'pending'::task_status
               ORDER BY priority DESC, created_at ASC
               LIMIT 1
               FOR UPDATE SKIP LOCKED"#,
            table = self.table
        );

        let Some(row) = sqlx::query(&select).fetch_optional(&mut *tx).await? else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: Uuid = row.try_get("id")?;
        let now = Utc::now();

        let update = format!(
            r#"UPDATE "{table}" SET status = 'processing'::task_status, updated_at = $2 WHERE id = $1"#,
            table = self.table
        );
        sqlx::query(&update).bind(id).bind(now).execute(&mut *tx).await?;

        let reselect = format!(r#"SELECT * FROM "{table}" WHERE id = $1"#, table = self.table);
        let row = sqlx::query(&reselect).bind(id).fetch_one(&mut *tx).await?;

        tx.commit().await?;
        Ok(Some(Self::row_to_task(&row)?))
    }

    async fn load_tasks(&self, status: StatusFilter) -> Result<Vec<Task>, BackendError> {
        let rows = match status {
            Some(status) => {
                let query = format!(
                    r#"SELECT * FROM "{table}" WHERE status = $1::task_status ORDER BY priority DESC, created_at ASC"#,
                    table = self.table
                );
                sqlx::query(&query).bind(status.to_string()).fetch_all(&self.pool).await?
            }
            None => {
                let query = format!(
                    r#"SELECT * FROM "{table}" ORDER BY priority DESC, created_at ASC"#,
                    table = self.table
                );
                sqlx::query(&query).fetch_all(&self.pool).await?
            }
        };

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, BackendError> {
        let query = format!(r#"SELECT * FROM "{table}" WHERE id = $1"#, table = self.table);
        let row = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn update_task(
        &self,
        id: Uuid,
        update: TaskUpdate,
    ) -> Result<Option<Task>, BackendError> {
        let Some(mut task) = self.get_task(id).await? else {
            return Ok(None);
        };

        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(log) = update.log {
            task.log = Some(log);
        }
        if let Some(retry_count) = update.retry_count {
            task.retry_count = retry_count;
        }
        if let Some(reclaim_count) = update.reclaim_count {
            task.reclaim_count = reclaim_count;
        }
        task.updated_at = Utc::now();

        let query = format!(
            r#"UPDATE "{table}"
               SET status = $2::task_status, log = $3, retry_count = $4, reclaim_count = $5, updated_at = $6
               WHERE id = $1"#,
            table = self.table
        );
        sqlx::query(&query)
            .bind(id)
            .bind(task.status.to_string())
            .bind(&task.log)
            .bind(task.retry_count as i32)
            .bind(task.reclaim_count as i32)
            .bind(task.updated_at)
            .execute(&self.pool)
            .await?;

        Ok(Some(task))
    }

    async fn delete_task(&self, id: Uuid, hard: bool) -> Result<Option<Task>, BackendError> {
        if hard {
            let Some(task) = self.get_task(id).await? else {
                return Ok(None);
            };
            let query = format!(r#"DELETE FROM "{table}" WHERE id = $1"#, table = self.table);
            sqlx::query(&query).bind(id).execute(&self.pool).await?;
            return Ok(Some(task));
        }

        self.update_task(id, TaskUpdate::status(TaskStatus::Deleted)).await
    }
}
