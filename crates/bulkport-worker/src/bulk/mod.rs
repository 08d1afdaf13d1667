//! Bulk request orchestration
//!
//! A bulk request is one uploaded spreadsheet processed by a named
//! [`RowProcessor`]. The [`BulkRequestService`] owns the request state
//! machine, streams the sheet row by row, aggregates counters and row logs,
//! and reconciles failures and cancellations against the freshest persisted
//! state so a concurrent cancellation is never overwritten.
//!
//! Persistence sits behind [`BulkRequestStore`], [`SourceFileStore`] and
//! [`QuotaLedger`]; the dispatcher behind [`JobHandle`].

use thiserror::Error;

use crate::cancel::Cancelled;
use crate::lock::LockError;
use crate::storage::StorageError;
use crate::transfer::TransferError;

mod jobs;
mod memory;
mod orchestrator;
mod postgres;
mod processor;
pub mod sheet;
mod state;
mod store;
mod two_phase;
mod types;

pub use jobs::{BulkJob, EventType, JobContext, JobHandle, JobOptions, ScheduleOptions};
pub use memory::MemoryBulkStore;
pub use orchestrator::{BulkRequestService, JobOutcome};
pub use postgres::PgBulkStore;
pub use processor::{
    CapabilityDescriptor, Capabilities, CompletionDirective, CompletionHook, Delegated,
    ErrorStateHook, Ownership, Row, RowOutcome, RowProcessor,
};
pub use state::{RequestLedger, TransitionOutcome};
pub use store::{BulkRequestStore, QuotaLedger, Reservation, SourceFileStore, UserQuota};
pub use two_phase::{media_pass, EntityOutcome, MediaPhaseHook, PhaseItem, MEDIA_PASS};
pub use types::{
    BulkRequest, BulkStatus, FileStatus, NewBulkRequest, RowCounters, RowLog, SourceFile,
    TransitionPatch, ORIGINAL_FILE_STATUS,
};

/// Result type alias for bulk operations
pub type Result<T> = std::result::Result<T, BulkError>;

/// Bulk request errors
#[derive(Error, Debug)]
pub enum BulkError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: BulkStatus, to: BulkStatus },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Processor error: {0}")]
    Processor(String),
}

impl BulkError {
    /// Routed to the cancellation path, never to FAILED
    pub fn is_cancellation(&self) -> bool {
        match self {
            BulkError::Cancelled(_) => true,
            BulkError::Transfer(e) => e.is_cancellation(),
            _ => false,
        }
    }
}

impl From<csv_async::Error> for BulkError {
    fn from(e: csv_async::Error) -> Self {
        BulkError::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for BulkError {
    fn from(e: serde_json::Error) -> Self {
        BulkError::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Checkpoint;

    #[test]
    fn test_nested_cancellation_is_detected() {
        let cancelled = Cancelled {
            checkpoint: Checkpoint::PartBoundary,
        };
        assert!(BulkError::from(cancelled).is_cancellation());
        assert!(BulkError::from(TransferError::from(cancelled)).is_cancellation());
        assert!(!BulkError::from(TransferError::Empty).is_cancellation());
        assert!(!BulkError::Processor("boom".into()).is_cancellation());
    }
}
