use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::store::{BulkRequestStore, QuotaLedger, Reservation, SourceFileStore};
use super::types::{
    BulkRequest, BulkStatus, FileStatus, NewBulkRequest, RowCounters, RowLog, SourceFile,
    TransitionPatch,
};
use super::{BulkError, Result};

#[derive(Debug, Clone)]
struct Quota {
    limit: u64,
    used: u64,
}

#[derive(Debug, Default)]
struct State {
    requests: HashMap<Uuid, BulkRequest>,
    logs: HashMap<Uuid, Vec<RowLog>>,
    files: HashMap<Uuid, SourceFile>,
    quotas: HashMap<Uuid, Quota>,
}

/// In-process bulk persistence covering requests, files and quotas
#[derive(Debug, Clone, Default)]
pub struct MemoryBulkStore {
    state: Arc<Mutex<State>>,
}

impl MemoryBulkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_file(&self, file: SourceFile) {
        self.lock().files.insert(file.id, file);
    }

    pub fn set_quota(&self, user_id: Uuid, limit: u64, used: u64) {
        self.lock().quotas.insert(user_id, Quota { limit, used });
    }

    pub fn quota_used(&self, user_id: Uuid) -> Option<u64> {
        self.lock().quotas.get(&user_id).map(|q| q.used)
    }

    /// Overwrite the status without transition checks, as an external writer would
    pub fn force_status(&self, id: Uuid, status: BulkStatus) {
        if let Some(request) = self.lock().requests.get_mut(&id) {
            request.status = status;
        }
    }

    fn not_found(id: Uuid) -> BulkError {
        BulkError::NotFound(format!("bulk request {}", id))
    }
}

#[async_trait]
impl BulkRequestStore for MemoryBulkStore {
    async fn create(&self, new: &NewBulkRequest) -> Result<BulkRequest> {
        let request = BulkRequest {
            id: new.id,
            company_id: new.company_id,
            requested_by: new.requested_by,
            file_id: new.file_id,
            file_name: new.file_name.clone(),
            processor: new.processor.clone(),
            status: BulkStatus::Pending,
            total_rows: new.total_rows,
            counters: RowCounters::default(),
            progress: 0,
            error_message: None,
            metadata: new.metadata.clone(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let mut state = self.lock();
        if state.requests.contains_key(&new.id) {
            return Err(BulkError::Persistence(format!(
                "bulk request {} already exists",
                new.id
            )));
        }
        state.requests.insert(new.id, request.clone());
        Ok(request)
    }

    async fn load(&self, id: Uuid) -> Result<BulkRequest> {
        self.lock()
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::not_found(id))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: BulkStatus,
        to: BulkStatus,
        patch: &TransitionPatch,
    ) -> Result<bool> {
        let mut state = self.lock();
        let request = state
            .requests
            .get_mut(&id)
            .ok_or_else(|| Self::not_found(id))?;

        if request.status != from {
            return Ok(false);
        }

        request.status = to;
        if to == BulkStatus::Processing && request.started_at.is_none() {
            request.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            request.completed_at = Some(Utc::now());
        }
        if let Some(message) = &patch.error_message {
            request.error_message = Some(message.clone());
        }
        if let Some(progress) = patch.progress {
            request.progress = progress;
        }
        if let Some(total) = patch.total_rows {
            request.total_rows = Some(total);
        }
        Ok(true)
    }

    async fn save_progress(&self, id: Uuid, counters: &RowCounters) -> Result<()> {
        let mut state = self.lock();
        let request = state
            .requests
            .get_mut(&id)
            .ok_or_else(|| Self::not_found(id))?;
        if request.status.is_terminal() {
            return Ok(());
        }

        let current = &mut request.counters;
        current.processed = current.processed.max(counters.processed);
        current.successful = current.successful.max(counters.successful);
        current.failed = current.failed.max(counters.failed);
        Ok(())
    }

    async fn set_progress(&self, id: Uuid, percent: u8) -> Result<()> {
        let mut state = self.lock();
        let request = state
            .requests
            .get_mut(&id)
            .ok_or_else(|| Self::not_found(id))?;
        if !request.status.is_terminal() {
            request.progress = percent.min(100);
        }
        Ok(())
    }

    async fn append_row_logs(&self, id: Uuid, logs: &[RowLog], cap: usize) -> Result<usize> {
        let mut state = self.lock();
        if !state.requests.contains_key(&id) {
            return Err(Self::not_found(id));
        }

        let stored = state.logs.entry(id).or_default();
        let room = cap.saturating_sub(stored.len());
        let kept = logs.len().min(room);
        stored.extend_from_slice(&logs[..kept]);
        Ok(kept)
    }

    async fn row_logs(&self, id: Uuid) -> Result<Vec<RowLog>> {
        Ok(self.lock().logs.get(&id).cloned().unwrap_or_default())
    }

    async fn merge_metadata(&self, id: Uuid, entries: Map<String, Value>) -> Result<()> {
        let mut state = self.lock();
        let request = state
            .requests
            .get_mut(&id)
            .ok_or_else(|| Self::not_found(id))?;
        request.metadata.extend(entries);
        Ok(())
    }
}

#[async_trait]
impl SourceFileStore for MemoryBulkStore {
    async fn get(&self, id: Uuid) -> Result<SourceFile> {
        self.lock()
            .files
            .get(&id)
            .cloned()
            .ok_or_else(|| BulkError::NotFound(format!("source file {}", id)))
    }

    async fn set_status(&self, id: Uuid, status: FileStatus) -> Result<()> {
        let mut state = self.lock();
        let file = state
            .files
            .get_mut(&id)
            .ok_or_else(|| BulkError::NotFound(format!("source file {}", id)))?;
        file.status = status;
        Ok(())
    }

    async fn mark_deleted(&self, id: Uuid) -> Result<()> {
        self.set_status(id, FileStatus::Deleted).await
    }
}

#[async_trait]
impl QuotaLedger for MemoryBulkStore {
    async fn try_reserve(&self, user_id: Uuid, bytes: u64) -> Result<Reservation> {
        let mut state = self.lock();
        let Some(quota) = state.quotas.get_mut(&user_id) else {
            return Ok(Reservation::Granted);
        };
        match quota.used.checked_add(bytes).filter(|used| *used <= quota.limit) {
            Some(used) => {
                quota.used = used;
                Ok(Reservation::Granted)
            },
            None => Ok(Reservation::Denied {
                remaining: quota.limit.saturating_sub(quota.used),
            }),
        }
    }

    async fn release(&self, user_id: Uuid, bytes: u64) -> Result<()> {
        if let Some(quota) = self.lock().quotas.get_mut(&user_id) {
            quota.used = quota.used.saturating_sub(bytes);
        }
        Ok(())
    }
}
