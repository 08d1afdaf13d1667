//! Work-unit queue against a live Postgres (`DATABASE_URL`)
//!
//! Run with `cargo test --test job_queue -- --ignored`.

use async_trait::async_trait;
use serde_json::Map;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use bulkport_worker::bulk::{BulkJob, EventType, JobHandle, JobOptions, ScheduleOptions};
use bulkport_worker::cancel::{CancelSignal, CancellationProbe, Checkpoint};
use bulkport_worker::queue::{FailDisposition, JobStatus, PgJobHandle, PgJobQueue};

/// A file and a PROCESSING request for units to point at
async fn seed_request(pool: &PgPool) -> Uuid {
    let file_id = Uuid::new_v4();
    let request_id = Uuid::new_v4();

    sqlx::query("INSERT INTO source_files (id, company_id, name, storage_key) VALUES ($1, $2, 'items.csv', 'uploads/items.csv')")
        .bind(file_id)
        .bind(Uuid::new_v4())
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        r#"
        INSERT INTO bulk_requests (id, company_id, requested_by, file_id, file_name, processor, status)
        VALUES ($1, $2, $3, $4, 'items.csv', 'media-catalog', 'PROCESSING')
        "#,
    )
    .bind(request_id)
    .bind(Uuid::new_v4())
    .bind(Uuid::new_v4())
    .bind(file_id)
    .execute(pool)
    .await
    .unwrap();

    request_id
}

fn unit(request_id: Uuid) -> BulkJob {
    BulkJob {
        request_id,
        event_type: EventType::ProcessFile,
        file_id: Uuid::new_v4(),
        file_name: "items.csv".to_string(),
        company_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        processor: "media-catalog".to_string(),
        options: JobOptions::default(),
        metadata: Map::new(),
    }
}

fn attempts(max: u32) -> ScheduleOptions {
    ScheduleOptions::immediate(max, Duration::from_secs(3600))
}

async fn status_of(pool: &PgPool, id: Uuid) -> JobStatus {
    let (status,): (String,) = sqlx::query_as("SELECT status FROM bulk_jobs WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap();
    JobStatus::from(status)
}

/// Make a pending unit claimable now, skipping its backoff
async fn run_now(pool: &PgPool, id: Uuid) {
    sqlx::query("UPDATE bulk_jobs SET run_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

async fn stop_heartbeat(pool: &PgPool, id: Uuid) {
    sqlx::query("UPDATE bulk_jobs SET heartbeat_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_failed_unit_retries_then_fails_for_good(pool: PgPool) {
    let queue = PgJobQueue::new(pool.clone());
    let request_id = seed_request(&pool).await;
    let id = queue.enqueue(&unit(request_id), attempts(2)).await.unwrap();
    let worker = Uuid::new_v4();

    let claimed = queue.claim(worker).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.attempts, 1);

    let first = queue.fail(id, "storage unreachable").await.unwrap();
    assert_eq!(
        first,
        FailDisposition::Retrying {
            attempts: 1,
            max_attempts: 2
        }
    );
    assert_eq!(status_of(&pool, id).await, JobStatus::Pending);
    // Backoff keeps it out of reach for now
    assert!(queue.claim(worker).await.unwrap().is_none());

    run_now(&pool, id).await;
    let claimed = queue.claim(worker).await.unwrap().unwrap();
    assert_eq!(claimed.attempts, 2);

    let second = queue.fail(id, "storage unreachable").await.unwrap();
    assert_eq!(second, FailDisposition::Exhausted { attempts: 2 });
    assert_eq!(status_of(&pool, id).await, JobStatus::Failed);

    run_now(&pool, id).await;
    assert!(queue.claim(worker).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_stalled_unit_is_reclaimed(pool: PgPool) {
    let queue = PgJobQueue::new(pool.clone());
    let request_id = seed_request(&pool).await;
    let retried = queue.enqueue(&unit(request_id), attempts(3)).await.unwrap();
    let worker = Uuid::new_v4();

    queue.claim(worker).await.unwrap().unwrap();

    // A fresh heartbeat is not a stall
    assert!(queue.reclaim_stale(Duration::from_secs(60)).await.unwrap().is_empty());

    stop_heartbeat(&pool, retried).await;
    let stalled = queue.reclaim_stale(Duration::from_secs(60)).await.unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].id, retried);
    assert!(!stalled[0].exhausted);
    assert_eq!(stalled[0].job.request_id, request_id);
    assert_eq!(status_of(&pool, retried).await, JobStatus::Pending);

    let again = queue.claim(Uuid::new_v4()).await.unwrap().unwrap();
    assert_eq!(again.id, retried);
    assert_eq!(again.attempts, 2);

    // Out of attempts the stall is final
    let last = queue.enqueue(&unit(request_id), attempts(1)).await.unwrap();
    let claimed = queue.claim(worker).await.unwrap().unwrap();
    assert_eq!(claimed.id, last);
    stop_heartbeat(&pool, last).await;

    let stalled = queue.reclaim_stale(Duration::from_secs(60)).await.unwrap();
    let exhausted: Vec<_> = stalled.iter().filter(|s| s.id == last).collect();
    assert_eq!(exhausted.len(), 1);
    assert!(exhausted[0].exhausted);
    assert_eq!(status_of(&pool, last).await, JobStatus::Failed);
}

/// Cancellation as the bulk service observes it through the unit's handle
struct HandleProbe(Arc<dyn JobHandle>);

#[async_trait]
impl CancellationProbe for HandleProbe {
    async fn is_cancel_requested(&self) -> bool {
        self.0.is_cancel_requested().await.unwrap_or(false)
    }
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_cancel_request_reaches_running_unit(pool: PgPool) {
    let queue = PgJobQueue::new(pool.clone());
    let request_id = seed_request(&pool).await;
    let id = queue.enqueue(&unit(request_id), attempts(3)).await.unwrap();
    let cleanup = queue
        .enqueue(
            &BulkJob {
                event_type: EventType::Cleanup,
                ..unit(request_id)
            },
            ScheduleOptions {
                delay: Duration::from_secs(3600),
                ..attempts(3)
            },
        )
        .await
        .unwrap();

    let claimed = queue.claim(Uuid::new_v4()).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);

    let handle: Arc<dyn JobHandle> = Arc::new(PgJobHandle::new(queue.clone(), id));
    let signal = CancelSignal::with_probe(Arc::new(HandleProbe(handle)), Duration::ZERO);
    assert!(signal.checkpoint(Checkpoint::BeforeRow).await.is_ok());

    assert!(queue.request_cancel(request_id).await.unwrap());

    let err = signal.checkpoint(Checkpoint::BeforeRow).await.unwrap_err();
    assert_eq!(err.checkpoint, Checkpoint::BeforeRow);
    assert!(signal.is_cancelled());

    let (status,): (String,) = sqlx::query_as("SELECT status FROM bulk_requests WHERE id = $1")
        .bind(request_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "CANCELLING");

    // Cleanup units still run after a cancellation
    let (flagged,): (bool,) = sqlx::query_as("SELECT cancel_requested FROM bulk_jobs WHERE id = $1")
        .bind(cleanup)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(!flagged);
}
