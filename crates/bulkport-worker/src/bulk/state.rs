use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::BulkRequestStore;
use super::types::{BulkRequest, BulkStatus, TransitionPatch};
use super::{BulkError, Result};

/// Attempts to re-read and re-apply a walk after losing a race
const MAX_WALK_RETRIES: usize = 4;

/// Result of a status change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The request is now in the target state
    Applied,
    /// The request was already terminal; nothing changed
    Ignored(BulkStatus),
    /// The request is in a state the target cannot be reached from
    Conflict(BulkStatus),
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

/// Applies status transitions with compare-and-set semantics
///
/// Every write is conditional on the status last read, so two workers (or a
/// worker and an external cancellation) can never both win a transition,
/// and terminal states are never left.
#[derive(Clone)]
pub struct RequestLedger {
    store: Arc<dyn BulkRequestStore>,
}

impl RequestLedger {
    pub fn new(store: Arc<dyn BulkRequestStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn BulkRequestStore> {
        &self.store
    }

    pub async fn load(&self, id: Uuid) -> Result<BulkRequest> {
        self.store.load(id).await
    }

    /// Single step `from → to`
    pub async fn transition(
        &self,
        id: Uuid,
        from: BulkStatus,
        to: BulkStatus,
        patch: &TransitionPatch,
    ) -> Result<TransitionOutcome> {
        if !from.can_transition_to(to) {
            return Err(BulkError::InvalidTransition { from, to });
        }

        if self.store.transition(id, from, to, patch).await? {
            debug!(request_id = %id, from = %from, to = %to, "Request status changed");
            return Ok(TransitionOutcome::Applied);
        }

        let current = self.store.load(id).await?.status;
        Ok(self.refused(id, current, to))
    }

    /// Move through every intermediate state needed to reach `target`
    ///
    /// `patch` is applied on the final step only. Losing a race re-reads the
    /// status and continues from there.
    pub async fn walk_to(
        &self,
        id: Uuid,
        target: BulkStatus,
        patch: &TransitionPatch,
    ) -> Result<TransitionOutcome> {
        for _ in 0..MAX_WALK_RETRIES {
            let current = self.store.load(id).await?.status;
            if current == target {
                return Ok(TransitionOutcome::Applied);
            }

            let Some(steps) = current.path_to(target) else {
                return Ok(self.refused(id, current, target));
            };

            let mut from = current;
            let mut lost_race = false;
            for (index, step) in steps.iter().enumerate() {
                let step_patch = if index + 1 == steps.len() {
                    patch.clone()
                } else {
                    TransitionPatch::default()
                };
                if !self.store.transition(id, from, *step, &step_patch).await? {
                    lost_race = true;
                    break;
                }
                debug!(request_id = %id, from = %from, to = %step, "Request status changed");
                from = *step;
            }

            if !lost_race {
                return Ok(TransitionOutcome::Applied);
            }
        }

        let current = self.store.load(id).await?.status;
        Ok(self.refused(id, current, target))
    }

    fn refused(&self, id: Uuid, current: BulkStatus, target: BulkStatus) -> TransitionOutcome {
        if current.is_terminal() {
            info!(
                request_id = %id,
                status = %current,
                requested = %target,
                "Request already terminal, ignoring status change"
            );
            TransitionOutcome::Ignored(current)
        } else {
            warn!(
                request_id = %id,
                status = %current,
                requested = %target,
                "Status change refused"
            );
            TransitionOutcome::Conflict(current)
        }
    }
}
