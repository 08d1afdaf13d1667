//! Cooperative cancellation
//!
//! A [`CancelSignal`] is handed to every long-running operation and awaited
//! at named [`Checkpoint`]s. It combines a local
//! [`CancellationToken`](tokio_util::sync::CancellationToken) with an optional
//! [`CancellationProbe`] that asks the outside world (the dispatcher flag,
//! the persisted request status) whether the work should stop.
//!
//! Probes hit the network or the database, so they are throttled to at most
//! one call per poll interval. Once a probe reports cancellation the token is
//! latched and every later checkpoint fails immediately without probing.
//!
//! Nothing is pre-empted: work stops at the next checkpoint, so the reaction
//! latency of each checkpoint is bounded by the work between two of them
//! (documented on the variants) plus the poll interval.

use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Places where in-flight work may observe cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    /// Before each concurrency group of a transfer batch. Latency: one group.
    BeforeBatch,
    /// Before sleeping ahead of a retry. Latency: one failed attempt.
    BeforeRetry,
    /// Before opening a remote request. Latency: one attempt setup.
    BeforeRequest,
    /// Before reserving quota for declared or streamed bytes. Latency: one chunk.
    BeforeQuotaCheck,
    /// Before uploading each multipart part. Latency: one part transfer.
    PartBoundary,
    /// Before handing the next spreadsheet row to the processor. Latency: one row.
    BeforeRow,
    /// Before each entity of a paged phase. Latency: one entity.
    BeforeEntity,
}

impl Checkpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Checkpoint::BeforeBatch => "before_batch",
            Checkpoint::BeforeRetry => "before_retry",
            Checkpoint::BeforeRequest => "before_request",
            Checkpoint::BeforeQuotaCheck => "before_quota_check",
            Checkpoint::PartBoundary => "part_boundary",
            Checkpoint::BeforeRow => "before_row",
            Checkpoint::BeforeEntity => "before_entity",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised at the checkpoint where cancellation was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled at {checkpoint}")]
pub struct Cancelled {
    pub checkpoint: Checkpoint,
}

/// External source of cancellation requests
#[async_trait]
pub trait CancellationProbe: Send + Sync {
    async fn is_cancel_requested(&self) -> bool;
}

/// Cancellation token threaded through every suspension point
#[derive(Clone)]
pub struct CancelSignal {
    token: CancellationToken,
    probe: Option<Arc<dyn CancellationProbe>>,
    poll_interval: Duration,
    last_poll: Arc<Mutex<Option<Instant>>>,
}

impl CancelSignal {
    /// A signal that only fires when [`cancel`](Self::cancel) is called
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            probe: None,
            poll_interval: Duration::ZERO,
            last_poll: Arc::new(Mutex::new(None)),
        }
    }

    /// A signal that also consults `probe`, at most once per `poll_interval`
    pub fn with_probe(probe: Arc<dyn CancellationProbe>, poll_interval: Duration) -> Self {
        Self {
            probe: Some(probe),
            poll_interval,
            ..Self::new()
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once cancellation has been latched; never probes
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail with [`Cancelled`] if cancellation was requested
    pub async fn checkpoint(&self, at: Checkpoint) -> Result<(), Cancelled> {
        if self.token.is_cancelled() {
            return Err(Cancelled { checkpoint: at });
        }

        if let Some(probe) = &self.probe {
            if self.poll_due() && probe.is_cancel_requested().await {
                tracing::info!(checkpoint = %at, "Cancellation requested");
                self.token.cancel();
                return Err(Cancelled { checkpoint: at });
            }
        }

        Ok(())
    }

    fn poll_due(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_poll.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) if now.duration_since(at) < self.poll_interval => false,
            _ => {
                *last = Some(now);
                true
            },
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.token.is_cancelled())
            .field("has_probe", &self.probe.is_some())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}
