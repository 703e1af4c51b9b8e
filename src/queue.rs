//! SQLite-backed [`TaskQueue`].
//!
//! Claiming is a single `UPDATE ... WHERE id = (SELECT ...) RETURNING *`
//! statement. SQLite serialises writers, so two workers can never take the
//! same row. Timestamps are unix milliseconds. A claim stamps
//! `lease_expires_at`; a `processing` row past it is claimable again.
//!
//! Settling a task (`complete`, `fail`, `abandon`) matches on
//! `locked_by` as well as the id. A worker whose lease was taken over gets
//! [`LeaseLost`] and the row is left alone.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use finsight_core::error::LeaseLost;
use finsight_core::queue::{
    lease_deadline, NewTask, ProcessingTask, QueueStat, TaskQueue, TaskStatus, TaskType,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

#[derive(Clone)]
pub struct SqliteTaskQueue {
    pool: SqlitePool,
}

impl SqliteTaskQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<ProcessingTask>> {
        let row = sqlx::query("SELECT * FROM processing_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    /// The error for a settle that matched no row: the task is unknown, or
    /// `worker_id` no longer holds it.
    async fn not_held(&self, task_id: &str, worker_id: &str) -> Result<anyhow::Error> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM processing_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match exists {
            Some(_) => LeaseLost::new(task_id, worker_id).into(),
            None => anyhow!("unknown task {}", task_id),
        })
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("invalid timestamp {}", ms))
}

fn row_to_task(row: &SqliteRow) -> Result<ProcessingTask> {
    let id: String = row.get("id");
    let task_type: String = row.get("task_type");
    let status: String = row.get("status");
    let payload: String = row.get("payload");
    let attempts: i64 = row.get("attempts");
    let max_attempts: i64 = row.get("max_attempts");
    let priority: i64 = row.get("priority");
    let locked_at: Option<i64> = row.get("locked_at");
    let lease_expires_at: Option<i64> = row.get("lease_expires_at");
    let created_at: i64 = row.get("created_at");

    Ok(ProcessingTask {
        document_id: row.get("document_id"),
        task_type: task_type.parse::<TaskType>()?,
        status: status.parse::<TaskStatus>()?,
        priority: i32::try_from(priority).with_context(|| format!("task {} priority", id))?,
        attempts: u32::try_from(attempts).with_context(|| format!("task {} attempts", id))?,
        max_attempts: u32::try_from(max_attempts)
            .with_context(|| format!("task {} max_attempts", id))?,
        payload: serde_json::from_str(&payload)
            .with_context(|| format!("Corrupt payload on task {}", id))?,
        locked_by: row.get("locked_by"),
        locked_at: locked_at.map(millis_to_datetime).transpose()?,
        lease_expires_at: lease_expires_at.map(millis_to_datetime).transpose()?,
        last_error: row.get("last_error"),
        created_at: millis_to_datetime(created_at)?,
        id,
    })
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, task: NewTask) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO processing_tasks (id, document_id, task_type, status, priority, attempts,
                                          max_attempts, payload, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&task.document_id)
        .bind(task.task_type.as_str())
        .bind(task.priority)
        .bind(i64::from(task.max_attempts))
        .bind(serde_json::to_string(&task.payload)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to enqueue {} for {}", task.task_type, task.document_id))?;

        Ok(id)
    }

    async fn enqueue_unique(&self, task: NewTask) -> Result<Option<String>> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        let inserted = sqlx::query(
            r#"
            INSERT INTO processing_tasks (id, document_id, task_type, status, priority, attempts,
                                          max_attempts, payload, created_at, updated_at)
            SELECT ?1, ?2, ?3, 'pending', ?4, 0, ?5, ?6, ?7, ?7
            WHERE NOT EXISTS (
                SELECT 1 FROM processing_tasks
                WHERE document_id = ?2 AND task_type = ?3
                  AND status IN ('pending', 'retrying', 'processing')
            )
            "#,
        )
        .bind(&id)
        .bind(&task.document_id)
        .bind(task.task_type.as_str())
        .bind(task.priority)
        .bind(i64::from(task.max_attempts))
        .bind(serde_json::to_string(&task.payload)?)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to enqueue {} for {}", task.task_type, task.document_id))?;

        Ok((inserted.rows_affected() > 0).then_some(id))
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<ProcessingTask>> {
        let claimed_at = Utc::now();
        let now = claimed_at.timestamp_millis();
        let expires = lease_deadline(claimed_at, lease).timestamp_millis();

        let row = sqlx::query(
            r#"
            UPDATE processing_tasks
            SET status = 'processing',
                attempts = attempts + 1,
                locked_by = ?1,
                locked_at = ?2,
                lease_expires_at = ?3,
                updated_at = ?2
            WHERE id = (
                SELECT id FROM processing_tasks
                WHERE status IN ('pending', 'retrying')
                   OR (status = 'processing' AND (lease_expires_at IS NULL OR lease_expires_at <= ?2))
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(expires)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn complete(&self, task_id: &str, worker_id: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let done = sqlx::query(
            r#"
            UPDATE processing_tasks
            SET status = 'completed', locked_by = NULL, locked_at = NULL, lease_expires_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'processing' AND locked_by = ?
            "#,
        )
        .bind(now)
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.not_held(task_id, worker_id).await?);
        }
        Ok(())
    }

    async fn fail(&self, task_id: &str, worker_id: &str, reason: &str) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let row = sqlx::query(
            r#"
            UPDATE processing_tasks
            SET status = CASE WHEN attempts < max_attempts THEN 'retrying' ELSE 'failed' END,
                last_error = ?,
                locked_by = NULL,
                locked_at = NULL,
                lease_expires_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'processing' AND locked_by = ?
            RETURNING status
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(task_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(self.not_held(task_id, worker_id).await?);
        };
        let status: String = row.get("status");
        Ok(status == TaskStatus::Retrying.as_str())
    }

    async fn abandon(&self, task_id: &str, worker_id: &str, reason: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let done = sqlx::query(
            r#"
            UPDATE processing_tasks
            SET status = 'failed', last_error = ?, locked_by = NULL, locked_at = NULL,
                lease_expires_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'processing' AND locked_by = ?
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.not_held(task_id, worker_id).await?);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<QueueStat>> {
        let rows = sqlx::query(
            r#"
            SELECT task_type, status, COUNT(*) AS n
            FROM processing_tasks
            GROUP BY task_type, status
            ORDER BY task_type, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = Vec::with_capacity(rows.len());
        for row in &rows {
            let task_type: String = row.get("task_type");
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            stats.push(QueueStat {
                task_type: task_type.parse()?,
                status: status.parse()?,
                count: n.max(0) as u64,
            });
        }
        stats.sort_by_key(|s| (s.task_type, s.status));
        Ok(stats)
    }
}
