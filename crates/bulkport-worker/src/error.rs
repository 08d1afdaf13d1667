//! Crate-level error type
//!
//! Each module keeps its own error enum; [`WorkerError`] wraps them for
//! callers that drive several modules at once.

use thiserror::Error;

use crate::bulk::BulkError;
use crate::lock::LockError;
use crate::queue::QueueError;
use crate::storage::StorageError;
use crate::transfer::TransferError;

/// Result type alias for cross-module operations
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Bulk(#[from] BulkError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl WorkerError {
    pub fn is_cancellation(&self) -> bool {
        match self {
            WorkerError::Transfer(e) => e.is_cancellation(),
            WorkerError::Bulk(e) => e.is_cancellation(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{Cancelled, Checkpoint};

    #[test]
    fn test_cancellation_survives_wrapping() {
        let cancelled = Cancelled {
            checkpoint: Checkpoint::BeforeRow,
        };
        assert!(WorkerError::from(BulkError::from(cancelled)).is_cancellation());
        assert!(!WorkerError::from(TransferError::Empty).is_cancellation());
    }
}
