use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::timeout;

use super::quota::QuotaBudget;
use super::session::MultipartSession;
use super::{Result, TransferError};
use crate::cancel::{CancelSignal, Checkpoint};

/// Bounds applied while consuming one body
#[derive(Debug, Clone, Copy)]
pub(crate) struct PumpLimits {
    pub part_size: usize,
    pub max_size: u64,
    /// Longest wait for the next chunk of the body
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pumped {
    pub bytes: u64,
    pub checksum: String,
}

/// Cut `body` into `part_size` parts and upload them through `session`
///
/// At most one part plus one network chunk is buffered. `reserved` holds the
/// quota already taken for this body (the declared size, if any) and grows as
/// more bytes arrive; the caller refunds it if the transfer fails.
pub(crate) async fn pump<S, B, E>(
    mut body: S,
    session: &mut MultipartSession,
    limits: PumpLimits,
    budget: &QuotaBudget,
    reserved: &mut u64,
    cancel: &CancelSignal,
) -> Result<Pumped>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    TransferError: From<E>,
{
    let part_size = limits.part_size.max(1);
    let mut pending: Vec<u8> = Vec::with_capacity(part_size);
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;

    loop {
        let next = timeout(limits.idle_timeout, body.next())
            .await
            .map_err(|_| {
                TransferError::Timeout(format!(
                    "no data received for {:?}",
                    limits.idle_timeout
                ))
            })?;

        let chunk = match next {
            Some(chunk) => chunk?,
            None => break,
        };
        let chunk = chunk.as_ref();
        if chunk.is_empty() {
            continue;
        }

        total += chunk.len() as u64;
        if total > limits.max_size {
            return Err(TransferError::SizeExceeded {
                limit: limits.max_size,
                actual: total,
            });
        }
        if total > *reserved {
            cancel.checkpoint(Checkpoint::BeforeQuotaCheck).await?;
            budget.reserve(total - *reserved).await?;
            *reserved = total;
        }

        hasher.update(chunk);
        pending.extend_from_slice(chunk);

        while pending.len() >= part_size {
            cancel.checkpoint(Checkpoint::PartBoundary).await?;
            let rest = pending.split_off(part_size);
            let part = std::mem::replace(&mut pending, rest);
            session.upload_part(part).await?;
        }
    }

    if total == 0 {
        return Err(TransferError::Empty);
    }

    if !pending.is_empty() {
        cancel.checkpoint(Checkpoint::PartBoundary).await?;
        session.upload_part(pending).await?;
    }

    Ok(Pumped {
        bytes: total,
        checksum: hex::encode(hasher.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use crate::transfer::session::PartUploader;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Collector {
        bodies: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl PartUploader for Collector {
        async fn put_part(&self, _url: &str, body: Vec<u8>) -> Result<String> {
            let mut bodies = self.bodies.lock().unwrap();
            bodies.push(body);
            Ok(format!("\"{}\"", bodies.len()))
        }
    }

    fn limits(part_size: usize, max_size: u64) -> PumpLimits {
        PumpLimits {
            part_size,
            max_size,
            idle_timeout: Duration::from_secs(5),
        }
    }

    async fn session(store: &Arc<MemoryObjectStore>, collector: &Arc<Collector>) -> MultipartSession {
        MultipartSession::open(
            store.clone(),
            collector.clone(),
            "k",
            None,
            Duration::from_secs(60),
        )
        .await
        .unwrap()
    }

    fn chunks(data: &[u8], size: usize) -> Vec<std::result::Result<Vec<u8>, TransferError>> {
        data.chunks(size).map(|c| Ok(c.to_vec())).collect()
    }

    #[tokio::test]
    async fn test_parts_reassemble_to_original_bytes() {
        let store = Arc::new(MemoryObjectStore::new("http://p"));
        let collector = Arc::new(Collector::default());
        let mut session = session(&store, &collector).await;

        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut reserved = 0;
        let pumped = pump(
            stream::iter(chunks(&data, 7)),
            &mut session,
            limits(64, 10_000),
            &QuotaBudget::unlimited(),
            &mut reserved,
            &CancelSignal::new(),
        )
        .await
        .unwrap();

        let bodies = collector.bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1000usize.div_ceil(64));
        assert!(bodies[..bodies.len() - 1].iter().all(|b| b.len() == 64));
        assert_eq!(bodies.concat(), data);
        assert_eq!(pumped.bytes, 1000);
        assert_eq!(pumped.checksum, hex::encode(Sha256::digest(&data)));
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_trailing_part() {
        let store = Arc::new(MemoryObjectStore::new("http://p"));
        let collector = Arc::new(Collector::default());
        let mut session = session(&store, &collector).await;

        let mut reserved = 0;
        pump(
            stream::iter(chunks(&[1u8; 128], 50)),
            &mut session,
            limits(64, 10_000),
            &QuotaBudget::unlimited(),
            &mut reserved,
            &CancelSignal::new(),
        )
        .await
        .unwrap();

        assert_eq!(collector.bodies.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_progressive_limits() {
        let store = Arc::new(MemoryObjectStore::new("http://p"));
        let collector = Arc::new(Collector::default());

        let mut s = session(&store, &collector).await;
        let mut reserved = 0;
        let err = pump(
            stream::iter(chunks(&[0u8; 300], 100)),
            &mut s,
            limits(64, 250),
            &QuotaBudget::unlimited(),
            &mut reserved,
            &CancelSignal::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::SizeExceeded { limit: 250, actual: 300 }));

        let mut s = session(&store, &collector).await;
        let budget = QuotaBudget::new(150);
        let mut reserved = 0;
        let err = pump(
            stream::iter(chunks(&[0u8; 300], 100)),
            &mut s,
            limits(64, 10_000),
            &budget,
            &mut reserved,
            &CancelSignal::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::QuotaExceeded { remaining: 50, required: 100 }));
        assert_eq!(reserved, 100);
    }

    #[tokio::test]
    async fn test_empty_body_is_an_error() {
        let store = Arc::new(MemoryObjectStore::new("http://p"));
        let collector = Arc::new(Collector::default());
        let mut s = session(&store, &collector).await;
        let mut reserved = 0;

        let err = pump(
            stream::iter(Vec::<std::result::Result<Vec<u8>, TransferError>>::new()),
            &mut s,
            limits(64, 100),
            &QuotaBudget::unlimited(),
            &mut reserved,
            &CancelSignal::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Empty));
    }

    #[tokio::test]
    async fn test_cancel_stops_at_part_boundary() {
        let store = Arc::new(MemoryObjectStore::new("http://p"));
        let collector = Arc::new(Collector::default());
        let mut s = session(&store, &collector).await;
        let cancel = CancelSignal::new();
        cancel.cancel();
        let mut reserved = u64::MAX;

        let err = pump(
            stream::iter(chunks(&[0u8; 128], 128)),
            &mut s,
            limits(64, u64::MAX),
            &QuotaBudget::unlimited(),
            &mut reserved,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancellation());
        assert!(collector.bodies.lock().unwrap().is_empty());
    }
}
