//! SQLite 任务存储（`async-sqlite` 特性）
//!
//! 任务主体以 JSON 存储，状态与活动时间单独成列以便巡检查询；进程重启后可恢复队列与租约。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::{JobStore, StoreResult};
use crate::core::StoreError;
use crate::job::{Job, JobEvent, JobId, JobStatus, QueueItem, QueueStatus, UsageEvent};

const ACTIVE_JOB_KEY: &str = "active_job";

/// SQLite 持久化存储
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 打开（或创建）数据库并建表
    pub async fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                last_activity_ms INTEGER NOT NULL,
                body TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_items (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                position INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                last_error TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scheduler_state (
                key TEXT PRIMARY KEY,
                value TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS usage_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                body TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS job_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                body TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_status ON queue_items(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events(job_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Job> {
        let body: String = row.get("body");
        let mut job: Job = serde_json::from_str(&body)?;
        job.status = JobStatus::parse(row.get::<String, _>("status").as_str());
        if let Some(at) = from_millis(row.get::<i64, _>("last_activity_ms")) {
            job.last_activity_at = at;
        }
        Ok(job)
    }

    fn queue_item_from_row(row: &sqlx::sqlite::SqliteRow) -> QueueItem {
        QueueItem {
            id: row.get("id"),
            job_id: row.get("job_id"),
            status: QueueStatus::parse(row.get::<String, _>("status").as_str()),
            priority: row.get::<i64, _>("priority") as i32,
            position: row.get::<i64, _>("position") as u64,
            created_at: from_millis(row.get::<i64, _>("created_at")).unwrap_or_else(Utc::now),
            started_at: row.get::<Option<i64>, _>("started_at").and_then(from_millis),
            completed_at: row.get::<Option<i64>, _>("completed_at").and_then(from_millis),
            last_error: row.get("last_error"),
        }
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

const QUEUE_COLUMNS: &str =
    "id, job_id, status, priority, position, created_at, started_at, completed_at, last_error";

#[async_trait]
impl JobStore for SqliteStore {
    async fn save_job(&self, job: &Job) -> StoreResult<()> {
        let body = serde_json::to_string(job)?;
        sqlx::query(
            "INSERT INTO jobs (id, status, last_activity_ms, body) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                body = excluded.body,
                last_activity_ms = MAX(jobs.last_activity_ms, excluded.last_activity_ms)",
        )
        .bind(&job.id)
        .bind(job.status.as_str())
        .bind(job.last_activity_at.timestamp_millis())
        .bind(&body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        let row = sqlx::query("SELECT status, last_activity_ms, body FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn jobs_with_status(&self, status: JobStatus) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query("SELECT status, last_activity_ms, body FROM jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> StoreResult<()> {
        let mut job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        job.status = status;
        job.error = error;
        job.updated_at = Utc::now();
        self.save_job(&job).await
    }

    async fn enqueue(&self, job_id: &str, priority: i32) -> StoreResult<QueueItem> {
        if self.get_job(job_id).await?.is_none() {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }

        let mut tx = self.pool.begin().await?;
        let next_position = "SELECT COALESCE(MAX(position) + 1, 0) AS next FROM queue_items";
        let position: i64 = sqlx::query(next_position)
            .fetch_one(&mut *tx)
            .await?
            .get("next");

        let item = QueueItem::new(job_id, priority, position as u64);
        sqlx::query(
            "INSERT INTO queue_items (id, job_id, status, priority, position, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(&item.job_id)
        .bind(item.status.as_str())
        .bind(item.priority as i64)
        .bind(position)
        .bind(item.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(item)
    }

    async fn get_queue_item(&self, id: &str) -> StoreResult<Option<QueueItem>> {
        let row = sqlx::query(&format!("SELECT {QUEUE_COLUMNS} FROM queue_items WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::queue_item_from_row))
    }

    async fn queue_item_for_job(&self, job_id: &str) -> StoreResult<Option<QueueItem>> {
        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queue_items WHERE job_id = ?
             ORDER BY position DESC LIMIT 1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::queue_item_from_row))
    }

    async fn list_queue(&self) -> StoreResult<Vec<QueueItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queue_items ORDER BY priority DESC, position ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::queue_item_from_row).collect())
    }

    async fn next_waiting_queue_item(&self) -> StoreResult<Option<QueueItem>> {
        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queue_items WHERE status = 'waiting'
             ORDER BY priority DESC, position ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::queue_item_from_row))
    }

    async fn mark_processing(&self, id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let other: Option<String> = sqlx::query(
            "SELECT id FROM queue_items WHERE status = 'processing' AND id != ? LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.get("id"));
        if let Some(other) = other {
            return Err(StoreError::Conflict(format!(
                "queue item {other} is already processing"
            )));
        }

        let result = sqlx::query(
            "UPDATE queue_items SET status = 'processing', started_at = ?, completed_at = NULL
             WHERE id = ?",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::QueueItemNotFound(id.to_string()));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_queue_status(
        &self,
        id: &str,
        status: QueueStatus,
        error: Option<String>,
    ) -> StoreResult<()> {
        let completed_at = status.is_finished().then(|| Utc::now().timestamp_millis());
        let result = sqlx::query(
            "UPDATE queue_items
             SET status = ?, completed_at = ?, last_error = COALESCE(?, last_error)
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::QueueItemNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn remove_queue_item(&self, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM queue_items WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn processing_items(&self) -> StoreResult<Vec<QueueItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queue_items WHERE status = 'processing'"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::queue_item_from_row).collect())
    }

    async fn set_active_job(&self, job_id: Option<&str>) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO scheduler_state (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(ACTIVE_JOB_KEY)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_job(&self) -> StoreResult<Option<JobId>> {
        let row = sqlx::query("SELECT value FROM scheduler_state WHERE key = ?")
            .bind(ACTIVE_JOB_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>("value")))
    }

    async fn update_heartbeat(&self, job_id: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE jobs SET last_activity_ms = MAX(last_activity_ms, ?) WHERE id = ?",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn last_activity_time(&self, job_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_activity_ms FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| from_millis(r.get::<i64, _>("last_activity_ms"))))
    }

    async fn record_usage(&self, event: UsageEvent) -> StoreResult<()> {
        sqlx::query("INSERT INTO usage_events (job_id, body) VALUES (?, ?)")
            .bind(&event.job_id)
            .bind(serde_json::to_string(&event)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn usage_events(&self, job_id: &str) -> StoreResult<Vec<UsageEvent>> {
        let rows = sqlx::query("SELECT body FROM usage_events WHERE job_id = ? ORDER BY id ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| -> StoreResult<UsageEvent> {
                Ok(serde_json::from_str(&r.get::<String, _>("body"))?)
            })
            .collect()
    }

    async fn record_event(&self, event: JobEvent) -> StoreResult<()> {
        sqlx::query("INSERT INTO job_events (job_id, body) VALUES (?, ?)")
            .bind(&event.job_id)
            .bind(serde_json::to_string(&event)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn events(&self, job_id: &str) -> StoreResult<Vec<JobEvent>> {
        let rows = sqlx::query("SELECT body FROM job_events WHERE job_id = ? ORDER BY id ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| -> StoreResult<JobEvent> {
                Ok(serde_json::from_str(&r.get::<String, _>("body"))?)
            })
            .collect()
    }
}
