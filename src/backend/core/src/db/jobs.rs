//! Postgres implementation of the job repository.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashSet;

use crate::error::{ErrorCode, QueueError, Result};
use crate::jobs::clock::SharedClock;
use crate::jobs::job::{JobCounts, JobId, JobStatus, NewJob, QueuedJob};
use crate::jobs::repository::{JobRepository, JobTransaction};

const COLUMNS: &str =
    "id, queue, payload, status, reserved_at, attempts, run_after, message, created_at, updated_at";

// ═══════════════════════════════════════════════════════════════════════════════
// Row Mapping
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
pub struct JobRow {
    pub id: i64,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub reserved_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub run_after: DateTime<Utc>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for QueuedJob {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: JobId(row.id),
            queue: row.queue,
            payload: row.payload,
            status: row.status.parse()?,
            reserved_at: row.reserved_at,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            run_after: row.run_after,
            message: row.message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<QueuedJob>> {
    rows.into_iter().map(QueuedJob::try_from).collect()
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn expect_row(affected: u64, id: JobId) -> Result<()> {
    if affected == 0 {
        Err(QueueError::job_not_found(id))
    } else {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Repository
// ═══════════════════════════════════════════════════════════════════════════════

/// Job repository on the `queued_jobs` table.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: PgPool,
    clock: SharedClock,
}

impl PgJobRepository {
    pub fn new(pool: PgPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn create(&self, job: NewJob) -> Result<QueuedJob> {
        let now = self.clock.now();
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO queued_jobs (queue, payload, status, attempts, run_after, created_at, updated_at)
            VALUES ($1, $2, 'pending', 0, $3, $4, $4)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(job.run_after)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn begin(&self) -> Result<Box<dyn JobTransaction>> {
        let tx = self.pool.begin().await.map_err(|e| {
            QueueError::with_internal(
                ErrorCode::DatabaseTransactionFailed,
                "Failed to open claim transaction",
                e.to_string(),
            )
        })?;
        Ok(Box::new(PgJobTransaction {
            tx,
            clock: self.clock.clone(),
            locked: HashSet::new(),
        }))
    }

    async fn mark_success(&self, job: &QueuedJob, message: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queued_jobs
            SET status = 'success', reserved_at = NULL, message = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(message)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        expect_row(result.rows_affected(), job.id)
    }

    async fn mark_failed(&self, job: &QueuedJob, message: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queued_jobs
            SET status = 'failed', reserved_at = NULL, attempts = attempts + 1,
                message = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(message)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        expect_row(result.rows_affected(), job.id)
    }

    async fn retry(&self, job: &QueuedJob, delay_minutes: u32, message: Option<&str>) -> Result<()> {
        let now = self.clock.now();
        let run_after = now + Duration::minutes(i64::from(delay_minutes));
        let result = sqlx::query(
            r#"
            UPDATE queued_jobs
            SET status = 'pending', reserved_at = NULL, attempts = attempts + 1,
                run_after = $2, message = COALESCE($3, message), updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(run_after)
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await?;

        expect_row(result.rows_affected(), job.id)
    }

    async fn clean_stuck_jobs(&self, timeout_minutes: u32) -> Result<u64> {
        let now = self.clock.now();
        let cutoff = now - Duration::minutes(i64::from(timeout_minutes));
        let result = sqlx::query(
            r#"
            UPDATE queued_jobs
            SET reserved_at = NULL, updated_at = $1
            WHERE status = 'pending' AND reserved_at IS NOT NULL AND reserved_at < $2
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn available_jobs(&self, queue: &str, limit_to: usize) -> Result<Vec<QueuedJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM queued_jobs
            WHERE queue = $1 AND status = 'pending' AND reserved_at IS NULL AND run_after <= $2
            ORDER BY id
            LIMIT $3
            "#
        ))
        .bind(queue)
        .bind(self.clock.now())
        .bind(limit(limit_to))
        .fetch_all(&self.pool)
        .await?;

        into_jobs(rows)
    }

    async fn failed_jobs(&self, queue: &str, limit_to: usize, max_retries: u32) -> Result<Vec<QueuedJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM queued_jobs
            WHERE queue = $1 AND status = 'failed' AND attempts < $2
            ORDER BY id
            LIMIT $3
            "#
        ))
        .bind(queue)
        .bind(i32::try_from(max_retries).unwrap_or(i32::MAX))
        .bind(limit(limit_to))
        .fetch_all(&self.pool)
        .await?;

        into_jobs(rows)
    }

    async fn job_by_id(&self, id: JobId) -> Result<Option<QueuedJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {COLUMNS} FROM queued_jobs WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueuedJob::try_from).transpose()
    }

    async fn delete_by_status(&self, queue: Option<&str>, status: JobStatus) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM queued_jobs
            WHERE status = $1 AND ($2::TEXT IS NULL OR queue = $2)
            "#,
        )
        .bind(status.as_str())
        .bind(queue)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        let (pending, reserved, success, failed): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending' AND reserved_at IS NULL),
                COUNT(*) FILTER (WHERE status = 'pending' AND reserved_at IS NOT NULL),
                COUNT(*) FILTER (WHERE status = 'success'),
                COUNT(*) FILTER (WHERE status = 'failed')
            FROM queued_jobs
            WHERE queue = $1
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        let count = |n: i64| u64::try_from(n).unwrap_or(0);
        Ok(JobCounts {
            pending: count(pending),
            reserved: count(reserved),
            success: count(success),
            failed: count(failed),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Claim Transaction
// ═══════════════════════════════════════════════════════════════════════════════

/// Claim transaction; dropping it without commit rolls back.
pub struct PgJobTransaction {
    tx: Transaction<'static, Postgres>,
    clock: SharedClock,
    locked: HashSet<JobId>,
}

#[async_trait]
impl JobTransaction for PgJobTransaction {
    async fn lock_job(&mut self, id: JobId) -> Result<Option<QueuedJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {COLUMNS} FROM queued_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.0)
        .fetch_optional(&mut *self.tx)
        .await?;

        if row.is_some() {
            self.locked.insert(id);
        }
        row.map(QueuedJob::try_from).transpose()
    }

    async fn reserve(&mut self, job: &QueuedJob) -> Result<QueuedJob> {
        if !self.locked.contains(&job.id) {
            return Err(QueueError::new(
                ErrorCode::JobReservationFailed,
                format!("Job {} must be locked before it is reserved", job.id),
            ));
        }

        let now = self.clock.now();
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE queued_jobs
            SET reserved_at = $2, updated_at = $2
            WHERE id = $1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(job.id.0)
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| QueueError::job_not_found(job.id))?;

        row.try_into()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(|e| {
            QueueError::with_internal(
                ErrorCode::DatabaseTransactionFailed,
                "Failed to commit claim transaction",
                e.to_string(),
            )
        })
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(|e| {
            QueueError::with_internal(
                ErrorCode::DatabaseTransactionFailed,
                "Failed to roll back claim transaction",
                e.to_string(),
            )
        })
    }
}
