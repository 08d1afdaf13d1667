use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{ClaimedJob, JobStatus, QueueError, Result};
use crate::bulk::{BulkJob, ScheduleOptions};

/// Longest delay between two attempts of a failed unit
const MAX_RETRY_DELAY_SECS: u64 = 300;

/// Longest delay or retention written to the table
const MAX_SCHEDULE_SECS: u64 = 366 * 24 * 60 * 60;

/// What [`PgJobQueue::fail`] did with the unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Back to pending for another attempt
    Retrying { attempts: i32, max_attempts: i32 },
    /// Out of attempts; the unit is failed for good
    Exhausted { attempts: i32 },
}

/// A running unit whose heartbeat stopped
#[derive(Debug, Clone)]
pub struct StalledJob {
    pub id: Uuid,
    pub job: BulkJob,
    /// True when the unit had no attempts left and was failed
    pub exhausted: bool,
}

/// Fate of a unit whose attempt number `attempts` just failed
pub(crate) fn disposition(attempts: i32, max_attempts: i32) -> FailDisposition {
    if attempts >= max_attempts {
        FailDisposition::Exhausted { attempts }
    } else {
        FailDisposition::Retrying {
            attempts,
            max_attempts,
        }
    }
}

/// Exponential backoff before the next attempt, capped
pub(crate) fn retry_delay(attempts: i32) -> Duration {
    let exponent = u32::try_from(attempts.max(0)).unwrap_or(0).min(16);
    Duration::from_secs(2u64.pow(exponent).min(MAX_RETRY_DELAY_SECS))
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs().min(MAX_SCHEDULE_SECS)).unwrap_or(i64::MAX)
}

/// Work units stored in the `bulk_jobs` table
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Add a unit that becomes claimable after `options.delay`
    #[instrument(skip(self, job), fields(request_id = %job.request_id, event = %job.event_type))]
    pub async fn enqueue(&self, job: &BulkJob, options: ScheduleOptions) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let max_attempts = i32::try_from(options.attempts.max(1)).unwrap_or(i32::MAX);

        sqlx::query(
            r#"
            INSERT INTO bulk_jobs
                (id, request_id, event_type, payload, max_attempts, run_at, retention_secs)
            VALUES ($1, $2, $3, $4, $5, NOW() + $6::bigint * INTERVAL '1 second', $7)
            "#,
        )
        .bind(id)
        .bind(job.request_id)
        .bind(job.event_type.as_str())
        .bind(Json(job))
        .bind(max_attempts)
        .bind(secs(options.delay))
        .bind(secs(options.retention))
        .execute(&self.pool)
        .await?;

        info!(job_id = %id, delay_secs = options.delay.as_secs(), "Work unit enqueued");
        Ok(id)
    }

    /// Atomically claim the oldest runnable unit
    pub async fn claim(&self, worker_id: Uuid) -> Result<Option<ClaimedJob>> {
        let row: Option<(Uuid, Json<BulkJob>, i32, i32)> = sqlx::query_as(
            r#"
            UPDATE bulk_jobs
            SET status = 'running',
                attempts = attempts + 1,
                worker_id = $1,
                claimed_at = NOW(),
                heartbeat_at = NOW(),
                started_at = COALESCE(started_at, NOW())
            WHERE id = (
                SELECT id FROM bulk_jobs
                WHERE status = 'pending'
                  AND run_at <= NOW()
                  AND NOT cancel_requested
                ORDER BY run_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, payload, attempts, max_attempts
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, Json(job), attempts, max_attempts)| ClaimedJob {
            id,
            job,
            attempts,
            max_attempts,
        }))
    }

    pub async fn heartbeat(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE bulk_jobs SET heartbeat_at = NOW() WHERE id = $1 AND status = 'running'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Progress also counts as a heartbeat
    pub async fn update_progress(&self, id: Uuid, percent: u8) -> Result<()> {
        sqlx::query("UPDATE bulk_jobs SET progress = $2, heartbeat_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(i16::from(percent.min(100)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_cancel_requested(&self, id: Uuid) -> Result<bool> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT cancel_requested FROM bulk_jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(flag,)| flag).ok_or(QueueError::NotFound(id))
    }

    /// Close a unit with a final status
    pub async fn finish(&self, id: Uuid, status: JobStatus, last_error: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE bulk_jobs
            SET status = $2,
                last_error = COALESCE($3, last_error),
                finished_at = NOW(),
                retain_until = NOW() + retention_secs * INTERVAL '1 second',
                heartbeat_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt; retries with backoff while attempts remain
    pub async fn fail(&self, id: Uuid, error_message: &str) -> Result<FailDisposition> {
        let mut tx = self.pool.begin().await?;

        let (attempts, max_attempts): (i32, i32) =
            sqlx::query_as("SELECT attempts, max_attempts FROM bulk_jobs WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(QueueError::NotFound(id))?;

        let disposition = disposition(attempts, max_attempts);
        let status = match disposition {
            FailDisposition::Retrying { .. } => JobStatus::Pending,
            FailDisposition::Exhausted { .. } => JobStatus::Failed,
        };

        sqlx::query(
            r#"
            UPDATE bulk_jobs
            SET status = $2,
                last_error = $3,
                worker_id = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL,
                run_at = NOW() + $4::bigint * INTERVAL '1 second',
                finished_at = CASE WHEN $2 = 'failed' THEN NOW() ELSE NULL END,
                retain_until = CASE
                    WHEN $2 = 'failed' THEN NOW() + retention_secs * INTERVAL '1 second'
                    ELSE NULL
                END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(secs(retry_delay(attempts)))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        match disposition {
            FailDisposition::Exhausted { attempts } => error!(
                job_id = %id,
                error = %error_message,
                attempts,
                "Work unit failed after max attempts"
            ),
            FailDisposition::Retrying {
                attempts,
                max_attempts,
            } => warn!(
                job_id = %id,
                attempts,
                max_attempts,
                error = %error_message,
                "Work unit failed, will retry"
            ),
        }
        Ok(disposition)
    }

    /// Reset running units whose heartbeat is older than `stall_timeout`
    pub async fn reclaim_stale(&self, stall_timeout: Duration) -> Result<Vec<StalledJob>> {
        let rows: Vec<(Uuid, Json<BulkJob>, String)> = sqlx::query_as(
            r#"
            UPDATE bulk_jobs
            SET status = CASE
                    WHEN attempts >= max_attempts THEN 'failed'
                    ELSE 'pending'
                END,
                last_error = 'stalled: no heartbeat',
                worker_id = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL,
                finished_at = CASE WHEN attempts >= max_attempts THEN NOW() ELSE NULL END,
                retain_until = CASE
                    WHEN attempts >= max_attempts THEN NOW() + retention_secs * INTERVAL '1 second'
                    ELSE NULL
                END
            WHERE status = 'running'
              AND heartbeat_at < NOW() - $1::bigint * INTERVAL '1 second'
            RETURNING id, payload, status
            "#,
        )
        .bind(secs(stall_timeout))
        .fetch_all(&self.pool)
        .await?;

        if !rows.is_empty() {
            warn!(count = rows.len(), "Reclaimed stalled work units");
        }

        Ok(rows
            .into_iter()
            .map(|(id, Json(job), status)| StalledJob {
                id,
                job,
                exhausted: JobStatus::from(status) == JobStatus::Failed,
            })
            .collect())
    }

    /// Close pending units flagged for cancellation and return them
    pub async fn claim_cancelled(&self) -> Result<Vec<(Uuid, BulkJob)>> {
        let rows: Vec<(Uuid, Json<BulkJob>)> = sqlx::query_as(
            r#"
            UPDATE bulk_jobs
            SET status = 'cancelled',
                finished_at = NOW(),
                retain_until = NOW() + retention_secs * INTERVAL '1 second'
            WHERE status = 'pending' AND cancel_requested
            RETURNING id, payload
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id, Json(job))| (id, job)).collect())
    }

    /// Delete finished units past their retention
    pub async fn purge_finished(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM bulk_jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND retain_until < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Ask a request to stop
    ///
    /// A processing request moves to CANCELLING; every open unit of the
    /// request is flagged. Returns false when there was nothing to cancel.
    #[instrument(skip(self))]
    pub async fn request_cancel(&self, request_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            UPDATE bulk_requests
            SET status = 'CANCELLING', updated_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(request_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let flagged = sqlx::query(
            r#"
            UPDATE bulk_jobs
            SET cancel_requested = TRUE
            WHERE request_id = $1
              AND status IN ('pending', 'running')
              AND event_type <> 'cleanup'
            "#,
        )
        .bind(request_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        info!(request_id = %request_id, moved, flagged, "Cancellation requested");
        Ok(moved > 0 || flagged > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_attempt_retries_until_exhausted() {
        assert_eq!(
            disposition(1, 3),
            FailDisposition::Retrying {
                attempts: 1,
                max_attempts: 3
            }
        );
        assert_eq!(disposition(3, 3), FailDisposition::Exhausted { attempts: 3 });
        // A stall counted past the limit is still final
        assert_eq!(disposition(4, 3), FailDisposition::Exhausted { attempts: 4 });
    }

    #[test]
    fn test_retry_delay_backs_off_with_a_cap() {
        assert_eq!(retry_delay(1), Duration::from_secs(2));
        assert_eq!(retry_delay(3), Duration::from_secs(8));
        assert_eq!(retry_delay(9), Duration::from_secs(MAX_RETRY_DELAY_SECS));
        assert_eq!(retry_delay(i32::MAX), Duration::from_secs(MAX_RETRY_DELAY_SECS));
        assert_eq!(retry_delay(-1), Duration::from_secs(1));
    }

    #[test]
    fn test_secs_is_clamped() {
        assert_eq!(secs(Duration::from_secs(90)), 90);
        assert_eq!(secs(Duration::MAX), MAX_SCHEDULE_SECS as i64);
    }
}
