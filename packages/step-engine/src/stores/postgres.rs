//! PostgreSQL job record store.
//!
//! Schema lives in `migrations/`. Status transitions are a single
//! conditional `UPDATE ... WHERE status = ANY($allowed)`, so two workers
//! completing children of the same parent can never move a terminal job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::jobs::{ChildStats, JobLogEntry, JobStatus, LogLevel, QueueJob};
use crate::traits::queue::JobRecordStore;

const JOB_COLUMNS: &str = "id, parent_id, job_type, name, phase, config, status, error, result, \
     progress_current, progress_total, created_at, started_at, completed_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    parent_id: Option<Uuid>,
    job_type: String,
    name: String,
    phase: String,
    config: serde_json::Value,
    status: String,
    error: Option<String>,
    result: Option<serde_json::Value>,
    progress_current: i64,
    progress_total: i64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for QueueJob {
    type Error = EngineError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(QueueJob {
            id: row.id,
            parent_id: row.parent_id,
            job_type: row.job_type,
            name: row.name,
            phase: row.phase,
            config: row.config,
            status: row.status.parse()?,
            error: row.error,
            result: row.result,
            progress_current: row.progress_current,
            progress_total: row.progress_total,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    sequence: i64,
    job_id: Uuid,
    level: String,
    message: String,
    phase: String,
    timestamp: DateTime<Utc>,
}

impl TryFrom<LogRow> for JobLogEntry {
    type Error = EngineError;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(JobLogEntry {
            sequence: row.sequence as u64,
            job_id: row.job_id,
            level: row.level.parse()?,
            message: row.message,
            phase: row.phase,
            timestamp: row.timestamp,
        })
    }
}

fn db_err(e: sqlx::Error) -> EngineError {
    EngineError::persistence(e)
}

/// `JobRecordStore` over a PostgreSQL pool.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_err)?;

        info!("Running step engine migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(EngineError::persistence)?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Resolve the outcome of a conditional status update.
    async fn transitioned(&self, id: Uuid, to: JobStatus, row: Option<JobRow>) -> Result<QueueJob> {
        match row {
            Some(row) => row.try_into(),
            // Lost the race or the job is gone: report which
            None => match self.get_job(id).await? {
                Some(current) => Err(EngineError::InvalidTransition {
                    job_id: id,
                    from: current.status,
                    to,
                }),
                None => Err(EngineError::JobNotFound(id)),
            },
        }
    }
}

#[async_trait]
impl JobRecordStore for PostgresJobStore {
    async fn insert_job(&self, job: &QueueJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_jobs (
                id, parent_id, job_type, name, phase, config, status, error, result,
                progress_current, progress_total, created_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id)
        .bind(job.parent_id)
        .bind(&job.job_type)
        .bind(&job.name)
        .bind(&job.phase)
        .bind(&job.config)
        .bind(job.status.as_str())
        .bind(&job.error)
        .bind(&job.result)
        .bind(job.progress_current)
        .bind(job.progress_total)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(QueueJob::try_from).transpose()
    }

    async fn transition(&self, id: Uuid, to: JobStatus, at: DateTime<Utc>) -> Result<QueueJob> {
        let allowed: Vec<&str> = JobStatus::allowed_from(to).iter().map(|s| s.as_str()).collect();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE queue_jobs
            SET status = $2,
                started_at = CASE WHEN $2 = 'running' THEN $3 ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed') THEN $3 ELSE completed_at END
            WHERE id = $1
              AND status = ANY($4)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(to.as_str())
        .bind(at)
        .bind(&allowed)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        self.transitioned(id, to, row).await
    }

    async fn fail(&self, id: Uuid, error: &str, at: DateTime<Utc>) -> Result<QueueJob> {
        let allowed: Vec<&str> = JobStatus::allowed_from(JobStatus::Failed)
            .iter()
            .map(|s| s.as_str())
            .collect();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE queue_jobs
            SET status = 'failed',
                error = $2,
                completed_at = $3
            WHERE id = $1
              AND status = ANY($4)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(error)
        .bind(at)
        .bind(&allowed)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        self.transitioned(id, JobStatus::Failed, row).await
    }

    async fn set_error(&self, id: Uuid, error: &str) -> Result<()> {
        let result = sqlx::query("UPDATE queue_jobs SET error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::JobNotFound(id));
        }
        Ok(())
    }

    async fn set_result(&self, id: Uuid, result: &serde_json::Value) -> Result<()> {
        let done = sqlx::query("UPDATE queue_jobs SET result = $2 WHERE id = $1")
            .bind(id)
            .bind(result)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Err(EngineError::JobNotFound(id));
        }
        Ok(())
    }

    async fn set_progress(&self, id: Uuid, current: i64, total: i64) -> Result<()> {
        let result = sqlx::query("UPDATE queue_jobs SET progress_current = $2, progress_total = $3 WHERE id = $1")
            .bind(id)
            .bind(current)
            .bind(total)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::JobNotFound(id));
        }
        Ok(())
    }

    async fn append_log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
        phase: &str,
    ) -> Result<JobLogEntry> {
        let row = sqlx::query_as::<_, LogRow>(
            r#"
            INSERT INTO queue_job_logs (job_id, level, message, phase, timestamp)
            SELECT $1, $2, $3, $4, NOW()
            WHERE EXISTS (SELECT 1 FROM queue_jobs WHERE id = $1)
            RETURNING sequence, job_id, level, message, phase, timestamp
            "#,
        )
        .bind(job_id)
        .bind(level.as_str())
        .bind(message)
        .bind(phase)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.ok_or(EngineError::JobNotFound(job_id))?.try_into()
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<QueueJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE parent_id = $1 ORDER BY created_at, id"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(QueueJob::try_from).collect()
    }

    async fn list_logs(&self, job_id: Uuid) -> Result<Vec<JobLogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT sequence, job_id, level, message, phase, timestamp
            FROM queue_job_logs
            WHERE job_id = $1
            ORDER BY sequence
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(JobLogEntry::try_from).collect()
    }

    async fn child_stats(&self, parent_id: Uuid) -> Result<ChildStats> {
        let counts: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM queue_jobs
            WHERE parent_id = $1
            GROUP BY status
            "#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut stats = ChildStats::default();
        for (status, count) in counts {
            let count = count as usize;
            stats.total += count;
            match status.parse()? {
                JobStatus::Pending => stats.pending += count,
                JobStatus::Running => stats.running += count,
                JobStatus::Completed => stats.completed += count,
                JobStatus::Failed => stats.failed += count,
            }
        }
        Ok(stats)
    }
}
