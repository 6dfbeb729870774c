//! Job storage contract and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{JobId, JobRow, JobStatus};

/// Job store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable job table.
///
/// The leasing operations (`claim_next`, `reclaim_stalled`) are atomic:
/// two concurrent callers never receive the same row. The Postgres
/// implementation enforces this with row-locked transactions; the
/// in-memory one with a single table lock.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `waiting` row.
    async fn insert(
        &self,
        job_name: &str,
        payload: &str,
        run_at: DateTime<Utc>,
    ) -> Result<JobId, StoreError>;

    /// Lease the oldest eligible `waiting` row: transition it to
    /// `processing` with a fresh heartbeat and return it.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobRow>, StoreError>;

    /// Return one `processing` row whose heartbeat is older than `cutoff`
    /// back to `waiting`. One row per call, like the worker lease.
    async fn reclaim_stalled(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRow>, StoreError>;

    /// Set a row's status.
    async fn mark_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError>;

    /// Return a row to `waiting`, eligible again at `run_at`.
    async fn defer(&self, id: JobId, run_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Heartbeat: refresh a row's `last_visited`.
    async fn touch(&self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Fetch a row by id.
    async fn get(&self, id: JobId) -> Result<Option<JobRow>, StoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(
        &self,
        job_name: &str,
        payload: &str,
        run_at: DateTime<Utc>,
    ) -> Result<JobId, StoreError> {
        (**self).insert(job_name, payload, run_at).await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobRow>, StoreError> {
        (**self).claim_next(now).await
    }

    async fn reclaim_stalled(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRow>, StoreError> {
        (**self).reclaim_stalled(cutoff, now).await
    }

    async fn mark_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError> {
        (**self).mark_status(id, status).await
    }

    async fn defer(&self, id: JobId, run_at: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).defer(id, run_at).await
    }

    async fn touch(&self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).touch(id, now).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRow>, StoreError> {
        (**self).get(id).await
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<i64, JobRow>,
    next_id: i64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn eligible(row: &JobRow, now: DateTime<Utc>) -> bool {
    row.status == JobStatus::Waiting && row.run_at.map_or(true, |at| at <= now)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(
        &self,
        job_name: &str,
        payload: &str,
        run_at: DateTime<Utc>,
    ) -> Result<JobId, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = JobId(inner.next_id);
        inner.rows.insert(
            id.0,
            JobRow {
                id,
                job_name: job_name.to_owned(),
                payload: payload.to_owned(),
                status: JobStatus::Waiting,
                run_at: Some(run_at),
                last_visited: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobRow>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        // BTreeMap iteration is id-ordered, so the oldest row wins.
        let candidate = inner
            .rows
            .values_mut()
            .find(|row| eligible(row, now));
        match candidate {
            Some(row) => {
                row.status = JobStatus::Processing;
                row.last_visited = now;
                Ok(Some(row.clone()))
            }
            None => Ok(None),
        }
    }

    async fn reclaim_stalled(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRow>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let candidate = inner
            .rows
            .values_mut()
            .find(|row| row.status == JobStatus::Processing && row.last_visited <= cutoff);
        match candidate {
            Some(row) => {
                row.status = JobStatus::Waiting;
                row.last_visited = now;
                Ok(Some(row.clone()))
            }
            None => Ok(None),
        }
    }

    async fn mark_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner.rows.get_mut(&id.0).ok_or(StoreError::NotFound(id))?;
        row.status = status;
        Ok(())
    }

    async fn defer(&self, id: JobId, run_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner.rows.get_mut(&id.0).ok_or(StoreError::NotFound(id))?;
        row.status = JobStatus::Waiting;
        row.run_at = Some(run_at);
        Ok(())
    }

    async fn touch(&self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner.rows.get_mut(&id.0).ok_or(StoreError::NotFound(id))?;
        row.last_visited = now;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRow>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.rows.get(&id.0).cloned())
    }
}
