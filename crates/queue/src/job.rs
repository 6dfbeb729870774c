//! Job row types.

use chrono::{DateTime, Utc};

/// Identifier of a job row (monotonic, store-assigned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle status.
///
/// ```text
///    waiting ──lease──▶ processing ──success──▶ complete
///       ▲                   │
///       └──failure/stall────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued; eligible once `run_at` has passed.
    Waiting,
    /// Leased by a worker; kept alive by `last_visited` heartbeats.
    Processing,
    /// Handler succeeded.
    Complete,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobStatus::Waiting),
            "processing" => Some(JobStatus::Processing),
            "complete" => Some(JobStatus::Complete),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable job.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: JobId,
    pub job_name: String,
    pub payload: String,
    pub status: JobStatus,
    /// Earliest instant the job is eligible to run; `None` means
    /// immediately.
    pub run_at: Option<DateTime<Utc>>,
    /// Heartbeat timestamp; a `processing` row whose heartbeat is older
    /// than the stall limit is reclaimed by the requeue loop.
    pub last_visited: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [JobStatus::Waiting, JobStatus::Processing, JobStatus::Complete] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("cancelled"), None);
    }
}
