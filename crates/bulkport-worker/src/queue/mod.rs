//! Postgres work-unit queue
//!
//! Implements the dispatcher the bulk service expects: delayed units with a
//! bounded number of attempts, atomic claims (`FOR UPDATE SKIP LOCKED`), a
//! heartbeat while a unit runs, stall detection, cancellation flags and
//! retention-based purge of finished units.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::bulk::{BulkError, BulkJob};

mod handle;
mod store;
mod worker;

pub use handle::PgJobHandle;
pub use store::{FailDisposition, PgJobQueue, StalledJob};
pub use worker::{Maintenance, QueueWorker};

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Bulk error: {0}")]
    Bulk(#[from] BulkError),
}

impl From<QueueError> for BulkError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Database(e) => BulkError::Database(e),
            QueueError::Bulk(e) => e,
            other => BulkError::Persistence(other.to_string()),
        }
    }
}

/// Work unit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Pending,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit claimed by this worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub job: BulkJob,
    /// Attempts including the current one
    pub attempts: i32,
    pub max_attempts: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from(status.as_str().to_string()), status);
        }
        assert!(JobStatus::Cancelled.is_finished());
        assert!(!JobStatus::Running.is_finished());
    }

    #[test]
    fn test_queue_errors_map_into_bulk_errors() {
        let err = BulkError::from(QueueError::NotFound(Uuid::nil()));
        assert!(matches!(err, BulkError::Persistence(_)));

        let inner = BulkError::from(QueueError::Bulk(BulkError::NotFound("x".into())));
        assert!(matches!(inner, BulkError::NotFound(_)));
    }
}
