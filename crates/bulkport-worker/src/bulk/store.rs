use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::types::{
    BulkRequest, BulkStatus, FileStatus, NewBulkRequest, RowCounters, RowLog, SourceFile,
    TransitionPatch,
};
use super::Result;
use crate::transfer::{QuotaSource, Result as TransferResult, TransferError};

/// Persistence of bulk requests and their row logs
#[async_trait]
pub trait BulkRequestStore: Send + Sync {
    async fn create(&self, request: &NewBulkRequest) -> Result<BulkRequest>;

    async fn load(&self, id: Uuid) -> Result<BulkRequest>;

    /// Compare-and-set the status; returns false if the request is no longer in `from`
    ///
    /// Entering PROCESSING stamps `started_at`; entering a terminal state
    /// stamps `completed_at`.
    async fn transition(
        &self,
        id: Uuid,
        from: BulkStatus,
        to: BulkStatus,
        patch: &TransitionPatch,
    ) -> Result<bool>;

    /// Store counters; each counter only moves forward
    async fn save_progress(&self, id: Uuid, counters: &RowCounters) -> Result<()>;

    async fn set_progress(&self, id: Uuid, percent: u8) -> Result<()>;

    /// Append logs while fewer than `cap` are stored; returns how many were kept
    async fn append_row_logs(&self, id: Uuid, logs: &[RowLog], cap: usize) -> Result<usize>;

    /// Row logs in append order
    async fn row_logs(&self, id: Uuid) -> Result<Vec<RowLog>>;

    /// Shallow-merge `entries` into the request metadata
    async fn merge_metadata(&self, id: Uuid, entries: Map<String, Value>) -> Result<()>;
}

/// Source file records
#[async_trait]
pub trait SourceFileStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<SourceFile>;

    async fn set_status(&self, id: Uuid, status: FileStatus) -> Result<()>;

    async fn mark_deleted(&self, id: Uuid) -> Result<()>;
}

/// Answer to a conditional quota reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted,
    Denied { remaining: u64 },
}

/// Per-user storage quota
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Add `bytes` to the user's usage only if it stays within the limit
    ///
    /// The check and the update are one atomic step, so workers of the same
    /// user cannot jointly overrun the quota. Users without a quota are
    /// always granted.
    async fn try_reserve(&self, user_id: Uuid, bytes: u64) -> Result<Reservation>;

    async fn release(&self, user_id: Uuid, bytes: u64) -> Result<()>;
}

/// One user's ledger entry seen as a transfer quota
pub struct UserQuota {
    ledger: Arc<dyn QuotaLedger>,
    user_id: Uuid,
}

impl UserQuota {
    pub fn new(ledger: Arc<dyn QuotaLedger>, user_id: Uuid) -> Self {
        Self { ledger, user_id }
    }
}

#[async_trait]
impl QuotaSource for UserQuota {
    async fn take(&self, bytes: u64) -> TransferResult<()> {
        match self.ledger.try_reserve(self.user_id, bytes).await {
            Ok(Reservation::Granted) => Ok(()),
            Ok(Reservation::Denied { remaining }) => Err(TransferError::QuotaExceeded {
                remaining,
                required: bytes,
            }),
            Err(e) => Err(TransferError::Quota(e.to_string())),
        }
    }

    async fn give_back(&self, bytes: u64) {
        if let Err(e) = self.ledger.release(self.user_id, bytes).await {
            warn!(user_id = %self.user_id, bytes, error = %e, "Failed to release quota");
        }
    }
}
