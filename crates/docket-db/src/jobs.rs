//! Job repository implementation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use docket_core::{
    defaults, failure_reason, new_v7, Document, Error, Job, JobRepository, JobStatus, QueueStats,
    Result,
};

/// Columns selected for every job read, in `parse_job_row` order.
const JOB_COLUMNS: &str = "id, job_type, status, priority, payload, result, error, progress, \
     progress_message, dedup_key, created_at, started_at, completed_at";

/// SQLite implementation of JobRepository.
#[derive(Clone)]
pub struct SqliteJobRepository {
    pool: SqlitePool,
    /// Woken on every successful submission so idle workers can skip the
    /// rest of their poll wait.
    notify: Arc<Notify>,
}

impl SqliteJobRepository {
    /// Create a new SqliteJobRepository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Create a new SqliteJobRepository sharing an existing notify handle.
    pub fn with_notify(pool: SqlitePool, notify: Arc<Notify>) -> Self {
        Self { pool, notify }
    }

    /// Get the job notification handle for event-driven waking.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn parse_document(raw: Option<String>) -> Result<Option<Document>> {
        raw.map(|s| serde_json::from_str::<Document>(&s))
            .transpose()
            .map_err(Error::from)
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: SqliteRow) -> Result<Job> {
        let id: String = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let payload: String = row.try_get("payload")?;

        Ok(Job {
            id: Uuid::parse_str(&id)
                .map_err(|e| Error::Serialization(format!("invalid job id {id}: {e}")))?,
            job_type: row.try_get("job_type")?,
            status: status.parse()?,
            priority: row.try_get("priority")?,
            payload: serde_json::from_str(&payload)?,
            result: Self::parse_document(row.try_get("result")?)?,
            error: row.try_get("error")?,
            progress: row.try_get("progress")?,
            progress_message: row.try_get("progress_message")?,
            dedup_key: row.try_get("dedup_key")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn parse_rows(rows: Vec<SqliteRow>) -> Result<Vec<Job>> {
        rows.into_iter().map(Self::parse_job_row).collect()
    }

    /// Explain why a guarded update matched no row.
    async fn transition_error(&self, job_id: Uuid, to: JobStatus) -> Error {
        let current: std::result::Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
                .bind(job_id.to_string())
                .fetch_optional(&self.pool)
                .await;

        match current {
            Ok(None) => Error::JobNotFound(job_id),
            Ok(Some(status)) => match status.parse::<JobStatus>() {
                Ok(from) => Error::InvalidTransition { job_id, from, to },
                Err(e) => e,
            },
            Err(e) => Error::Database(e),
        }
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    #[instrument(skip(self, payload), fields(subsystem = "db", op = "submit"))]
    async fn submit(&self, job_type: &str, payload: Document, priority: i32) -> Result<Uuid> {
        let job_id = new_v7();
        let now = Utc::now();
        let payload = serde_json::to_string(&payload)?;

        sqlx::query(
            "INSERT INTO jobs (id, job_type, status, priority, payload, progress, created_at)
             VALUES (?, ?, 'pending', ?, ?, 0, ?)",
        )
        .bind(job_id.to_string())
        .bind(job_type)
        .bind(priority)
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(%job_id, job_type, priority, "Job submitted");
        self.notify.notify_waiters();
        Ok(job_id)
    }

    #[instrument(skip(self, payload), fields(subsystem = "db", op = "submit_unique"))]
    async fn submit_unique(
        &self,
        job_type: &str,
        payload: Document,
        priority: i32,
        dedup_key: &str,
    ) -> Result<Option<Uuid>> {
        let job_id = new_v7();
        let now = Utc::now();
        let payload = serde_json::to_string(&payload)?;

        // Check-and-insert in one statement so concurrent submitters cannot
        // both pass the existence check.
        let inserted: Option<String> = sqlx::query_scalar(
            "INSERT INTO jobs (id, job_type, status, priority, payload, progress, dedup_key, created_at)
             SELECT ?1, ?2, 'pending', ?3, ?4, 0, ?5, ?6
             WHERE NOT EXISTS (
                 SELECT 1 FROM jobs
                 WHERE job_type = ?2 AND dedup_key = ?5
                   AND status IN ('pending', 'processing')
             )
             RETURNING id",
        )
        .bind(job_id.to_string())
        .bind(job_type)
        .bind(priority)
        .bind(payload)
        .bind(dedup_key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if inserted.is_some() {
            self.notify.notify_waiters();
            Ok(Some(job_id))
        } else {
            debug!(job_type, dedup_key, "Duplicate submission suppressed");
            Ok(None)
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let limit = limit.max(0);

        let rows = match status {
            Some(status) => sqlx::query(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE status = ?
                 ORDER BY priority DESC, created_at DESC, seq DESC
                 LIMIT ?"
            ))
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?,
            None => sqlx::query(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 ORDER BY created_at DESC, seq DESC
                 LIMIT ?"
            ))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?,
        };

        Self::parse_rows(rows)
    }

    #[instrument(skip(self), fields(subsystem = "db", op = "claim_next"))]
    async fn claim_next(&self) -> Result<Option<Job>> {
        let now = Utc::now();

        // A single UPDATE takes the write lock before evaluating the
        // subquery, so two claimers can never select the same row.
        let row = sqlx::query(&format!(
            "UPDATE jobs
             SET status = 'processing', started_at = ?
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE status = 'pending'
                 ORDER BY priority DESC, created_at ASC, seq ASC
                 LIMIT 1
             )
               AND status = 'pending'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let job = row.map(Self::parse_job_row).transpose()?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, job_type = %job.job_type, "Job claimed");
        }
        Ok(job)
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        percent: i32,
        message: Option<&str>,
    ) -> Result<()> {
        let percent = percent.clamp(0, 100);

        // Lower values and non-processing jobs match no row: a silent no-op.
        sqlx::query(
            "UPDATE jobs SET progress = ?1, progress_message = ?2
             WHERE id = ?3 AND status = 'processing' AND progress <= ?1",
        )
        .bind(percent)
        .bind(message)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    #[instrument(skip(self, result), fields(subsystem = "db", op = "complete"))]
    async fn complete(&self, job_id: Uuid, result: Document) -> Result<()> {
        let now = Utc::now();
        let result = serde_json::to_string(&result)?;

        let outcome = sqlx::query(
            "UPDATE jobs
             SET status = 'completed', result = ?, error = NULL, progress = 100,
                 completed_at = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(result)
        .bind(now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if outcome.rows_affected() == 0 {
            return Err(self.transition_error(job_id, JobStatus::Completed).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(subsystem = "db", op = "fail"))]
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        let now = Utc::now();

        let outcome = sqlx::query(
            "UPDATE jobs
             SET status = 'failed', error = ?, result = NULL, completed_at = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(failure_reason(error))
        .bind(now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if outcome.rows_affected() == 0 {
            return Err(self.transition_error(job_id, JobStatus::Failed).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(subsystem = "db", op = "cancel"))]
    async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let now = Utc::now();

        let outcome = sqlx::query(
            "UPDATE jobs
             SET status = 'cancelled', error = ?, completed_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(defaults::CANCELLED_REASON)
        .bind(now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if outcome.rows_affected() == 0 {
            return Err(self.transition_error(job_id, JobStatus::Cancelled).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(subsystem = "db", op = "fail_orphaned"))]
    async fn fail_orphaned(&self, reason: &str) -> Result<u64> {
        let now = Utc::now();

        let outcome = sqlx::query(
            "UPDATE jobs
             SET status = 'failed', error = ?, result = NULL, completed_at = ?
             WHERE status = 'processing'",
        )
        .bind(failure_reason(reason))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let swept = outcome.rows_affected();
        if swept > 0 {
            info!(swept, reason, "Failed orphaned processing jobs");
        }
        Ok(swept)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(CASE WHEN status = 'pending' THEN 1 END) AS pending,
                COUNT(CASE WHEN status = 'processing' THEN 1 END) AS processing,
                COUNT(CASE WHEN status = 'completed' THEN 1 END) AS completed,
                COUNT(CASE WHEN status = 'failed' THEN 1 END) AS failed,
                COUNT(CASE WHEN status = 'cancelled' THEN 1 END) AS cancelled,
                COUNT(*) AS total
             FROM jobs",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.try_get("pending")?,
            processing: row.try_get("processing")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            cancelled: row.try_get("cancelled")?,
            total: row.try_get("total")?,
        })
    }
}
