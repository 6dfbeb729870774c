//! Postgres-backed job store.
//!
//! Leasing uses `SELECT … FOR UPDATE SKIP LOCKED LIMIT 1` inside a
//! transaction: concurrent workers (on this replica or any other) never
//! receive the same row, and a worker that dies between SELECT and UPDATE
//! rolls its lock back with the connection.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use crate::job::{JobId, JobRow, JobStatus};
use crate::store::{JobStore, StoreError};

use async_trait::async_trait;

const SELECT_COLUMNS: &str = "id, job_name, payload, status, run_at, last_visited";

/// Postgres `jobs` table.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `jobs` table and its indices if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id BIGSERIAL PRIMARY KEY,
                job_name TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                run_at TIMESTAMPTZ,
                last_visited TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                deleted_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_jobs_table", e))?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_run_at ON jobs (run_at)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_last_visited ON jobs (last_visited)",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("create_jobs_index", e))?;
        }
        Ok(())
    }

    /// Lease one row matching `predicate` inside a transaction, moving it
    /// to `to_status` with a fresh heartbeat.
    async fn lease_one(
        &self,
        operation: &'static str,
        predicate: &str,
        cutoff: DateTime<Utc>,
        to_status: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRow>, StoreError> {
        let mut tx: Transaction<'_, Postgres> = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM jobs \
             WHERE {predicate} AND deleted_at IS NULL \
             ORDER BY id \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        );
        let row = sqlx::query(&query)
            .bind(cutoff)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let Some(row) = row else {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error(operation, e))?;
            return Ok(None);
        };
        let mut job = decode_job_row(&row)?;

        sqlx::query("UPDATE jobs SET status = $1, last_visited = $2, updated_at = $2 WHERE id = $3")
            .bind(to_status.as_str())
            .bind(now)
            .bind(job.id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        job.status = to_status;
        job.last_visited = now;
        Ok(Some(job))
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, payload), err)]
    async fn insert(
        &self,
        job_name: &str,
        payload: &str,
        run_at: DateTime<Utc>,
    ) -> Result<JobId, StoreError> {
        let row = sqlx::query(
            "INSERT INTO jobs (job_name, payload, status, run_at, last_visited) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id",
        )
        .bind(job_name)
        .bind(payload)
        .bind(JobStatus::Waiting.as_str())
        .bind(run_at)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(JobId(id))
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobRow>, StoreError> {
        self.lease_one(
            "claim_next",
            "status = 'waiting' AND (run_at <= $1 OR run_at IS NULL)",
            now,
            JobStatus::Processing,
            now,
        )
        .await
    }

    async fn reclaim_stalled(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRow>, StoreError> {
        self.lease_one(
            "reclaim_stalled",
            "status = 'processing' AND last_visited <= $1",
            cutoff,
            JobStatus::Waiting,
            now,
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn mark_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_status", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn defer(&self, id: JobId, run_at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'waiting', run_at = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(run_at)
        .bind(Utc::now())
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("defer", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn touch(&self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET last_visited = $1, updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("touch", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRow>, StoreError> {
        let query =
            format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE id = $1 AND deleted_at IS NULL");
        let row = sqlx::query(&query)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| decode_job_row(&r)).transpose()
    }
}

fn decode_job_row(row: &PgRow) -> Result<JobRow, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Storage(format!("decode job row: {e}"));

    let status_text: String = row.try_get("status").map_err(decode)?;
    let status = JobStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Storage(format!("unknown job status '{status_text}'")))?;

    Ok(JobRow {
        id: JobId(row.try_get("id").map_err(decode)?),
        job_name: row.try_get("job_name").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        status,
        run_at: row.try_get("run_at").map_err(decode)?,
        last_visited: row.try_get("last_visited").map_err(decode)?,
    })
}

/// Map sqlx errors to [`StoreError`].
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Storage(format!("database error in {operation}: {other}")),
    }
}
