use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use appshot_core::error::AppError;
use appshot_core::job::{Job, JobStatus, NewJob, Priority, Transition};
use appshot_core::job_store::JobStore;

/// PostgreSQL-backed job store. Transitions take a row lock
/// (`SELECT ... FOR UPDATE`) so concurrent workers serialize per job.
#[derive(Clone)]
pub struct JobRepository {
    pool: Pool<Postgres>,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, job: Job) -> Result<Job, AppError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO screenshot_jobs (
                id, app_id, store, client_id, priority, status, attempt_count, max_attempts,
                created_at, updated_at, started_at, completed_at, error_message, result, from_cache
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.app_id)
        .bind(job.store.as_str())
        .bind(&job.client_id)
        .bind(job.priority.weight())
        .bind(job.status.as_str())
        .bind(job.attempt_count as i32)
        .bind(job.max_attempts as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .bind(Json(&job.result))
        .bind(job.from_cache)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.try_into()
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    app_id: String,
    store: String,
    client_id: String,
    priority: i16,
    status: String,
    attempt_count: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    result: Json<Vec<String>>,
    from_cache: bool,
}

impl TryFrom<JobRow> for Job {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row.status.parse().map_err(|e: String| {
            AppError::DatabaseError(format!("Corrupt status on job {}: {e}", row.id))
        })?;
        let store = row.store.parse().map_err(|e: AppError| {
            AppError::DatabaseError(format!("Corrupt store on job {}: {e}", row.id))
        })?;

        Ok(Job {
            id: row.id,
            app_id: row.app_id,
            store,
            client_id: row.client_id,
            priority: Priority::from_weight(row.priority),
            status,
            attempt_count: row.attempt_count.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            result: row.result.0,
            from_cache: row.from_cache,
        })
    }
}

impl JobStore for JobRepository {
    async fn create(&self, request: NewJob) -> Result<Job, AppError> {
        self.insert(Job::from_request(request, Utc::now())).await
    }

    async fn record_cached(
        &self,
        request: NewJob,
        result: Vec<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<Job, AppError> {
        self.insert(Job::cached(request, result, completed_at, Utc::now()))
            .await
    }

    async fn transition(&self, job_id: Uuid, transition: Transition) -> Result<Job, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM screenshot_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?
        .ok_or(AppError::NotFound(job_id))?;

        // Dropping `tx` on error rolls back and releases the lock.
        let mut job: Job = row.try_into()?;
        job.apply(transition, Utc::now())?;

        sqlx::query(
            r#"
            UPDATE screenshot_jobs
            SET status = $2,
                attempt_count = $3,
                updated_at = $4,
                started_at = $5,
                completed_at = $6,
                error_message = $7,
                result = $8
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.attempt_count as i32)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .bind(Json(&job.result))
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(%job_id, status = %job.status, attempt = job.attempt_count, "Job transitioned");
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM screenshot_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(Job::try_from).transpose()
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, AppError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM screenshot_jobs
            WHERE ($1::VARCHAR IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM screenshot_jobs WHERE status = $1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count.max(0) as u64)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM screenshot_jobs
            WHERE status IN ('completed', 'failed') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
