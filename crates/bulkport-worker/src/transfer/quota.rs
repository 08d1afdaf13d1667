use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{Result, TransferError};

/// Quota held outside the process, shared by every worker of a user
#[async_trait]
pub trait QuotaSource: Send + Sync {
    /// Atomically take `bytes` if they fit
    ///
    /// Fails with [`TransferError::QuotaExceeded`] without taking anything
    /// when they don't.
    async fn take(&self, bytes: u64) -> Result<()>;

    /// Hand back bytes taken earlier; best-effort
    async fn give_back(&self, bytes: u64);
}

/// Byte budget shared by every transfer of one batch
///
/// Reservations are atomic, so concurrent downloads in the same group can
/// never jointly overrun the remaining quota. A budget backed by a
/// [`QuotaSource`] also reserves there, which extends the guarantee to other
/// workers of the same user. Bytes of an aborted or compensated transfer are
/// handed back with [`refund`](Self::refund).
#[derive(Clone)]
pub struct QuotaBudget {
    remaining: Arc<AtomicU64>,
    source: Option<Arc<dyn QuotaSource>>,
}

impl std::fmt::Debug for QuotaBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaBudget")
            .field("remaining", &self.remaining())
            .field("shared", &self.source.is_some())
            .finish()
    }
}

impl QuotaBudget {
    pub fn new(remaining: u64) -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(remaining)),
            source: None,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    /// Budget drawn from `source` as bytes arrive
    pub fn shared(source: Arc<dyn QuotaSource>) -> Self {
        Self {
            source: Some(source),
            ..Self::unlimited()
        }
    }

    /// Bytes left in the local budget
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Take `bytes` from the budget or fail without taking anything
    pub async fn reserve(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                left.checked_sub(bytes)
            })
            .map_err(|left| TransferError::QuotaExceeded {
                remaining: left,
                required: bytes,
            })?;

        if let Some(source) = &self.source {
            if let Err(e) = source.take(bytes).await {
                self.refund_local(bytes);
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn refund(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.refund_local(bytes);
        if let Some(source) = &self.source {
            source.give_back(bytes).await;
        }
    }

    fn refund_local(&self, bytes: u64) {
        let _ = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                Some(left.saturating_add(bytes))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_reserve_and_refund() {
        let budget = QuotaBudget::new(100);
        budget.reserve(60).await.unwrap();
        assert_eq!(budget.remaining(), 40);

        let err = budget.reserve(50).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::QuotaExceeded { remaining: 40, required: 50 }
        ));
        assert_eq!(budget.remaining(), 40);

        budget.refund(60).await;
        assert_eq!(budget.remaining(), 100);
    }

    #[tokio::test]
    async fn test_clones_share_the_budget() {
        let budget = QuotaBudget::new(10);
        let other = budget.clone();
        other.reserve(10).await.unwrap();
        assert!(budget.reserve(1).await.is_err());
    }

    #[tokio::test]
    async fn test_unlimited_never_overflows() {
        let budget = QuotaBudget::unlimited();
        budget.reserve(1).await.unwrap();
        budget.refund(5).await;
        assert_eq!(budget.remaining(), u64::MAX);
    }

    /// One user's quota as another worker would see it
    struct Ledger {
        limit: u64,
        used: Mutex<u64>,
    }

    #[async_trait]
    impl QuotaSource for Ledger {
        async fn take(&self, bytes: u64) -> Result<()> {
            let mut used = self.used.lock().unwrap();
            if *used + bytes > self.limit {
                return Err(TransferError::QuotaExceeded {
                    remaining: self.limit - *used,
                    required: bytes,
                });
            }
            *used += bytes;
            Ok(())
        }

        async fn give_back(&self, bytes: u64) {
            let mut used = self.used.lock().unwrap();
            *used = used.saturating_sub(bytes);
        }
    }

    #[tokio::test]
    async fn test_shared_budgets_cannot_jointly_overrun() {
        let ledger = Arc::new(Ledger {
            limit: 500,
            used: Mutex::new(0),
        });
        let first = QuotaBudget::shared(ledger.clone());
        let second = QuotaBudget::shared(ledger.clone());

        first.reserve(400).await.unwrap();
        let err = second.reserve(400).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::QuotaExceeded { remaining: 100, required: 400 }
        ));
        assert_eq!(second.remaining(), u64::MAX);

        first.refund(400).await;
        second.reserve(400).await.unwrap();
        assert_eq!(*ledger.used.lock().unwrap(), 400);
    }
}
