use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use super::store::{BulkRequestStore, QuotaLedger, Reservation, SourceFileStore};
use super::types::{
    BulkRequest, BulkStatus, FileStatus, NewBulkRequest, RowCounters, RowLog, SourceFile,
    TransitionPatch,
};
use super::{BulkError, Result};

const REQUEST_COLUMNS: &str = "id, company_id, requested_by, file_id, file_name, processor, status, \
     total_rows, processed_rows, successful_rows, failed_rows, progress, error_message, metadata, \
     created_at, started_at, completed_at";

#[derive(FromRow)]
struct RequestRow {
    id: Uuid,
    company_id: Uuid,
    requested_by: Uuid,
    file_id: Uuid,
    file_name: String,
    processor: String,
    status: String,
    total_rows: Option<i64>,
    processed_rows: i64,
    successful_rows: i64,
    failed_rows: i64,
    progress: i16,
    error_message: Option<String>,
    metadata: Json<Map<String, Value>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<RequestRow> for BulkRequest {
    fn from(row: RequestRow) -> Self {
        BulkRequest {
            id: row.id,
            company_id: row.company_id,
            requested_by: row.requested_by,
            file_id: row.file_id,
            file_name: row.file_name,
            processor: row.processor,
            status: BulkStatus::from(row.status),
            total_rows: row.total_rows.map(to_u64),
            counters: RowCounters {
                processed: to_u64(row.processed_rows),
                successful: to_u64(row.successful_rows),
                failed: to_u64(row.failed_rows),
            },
            progress: row.progress.clamp(0, 100) as u8,
            error_message: row.error_message,
            metadata: row.metadata.0,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(FromRow)]
struct RowLogRow {
    row_number: i64,
    entity_id: Option<String>,
    entity_type: String,
    errors: Json<Vec<String>>,
    warnings: Json<Vec<String>>,
    metadata: Json<Map<String, Value>>,
    processed_at: DateTime<Utc>,
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Postgres persistence for requests, row logs, source files and quotas
#[derive(Debug, Clone)]
pub struct PgBulkStore {
    pool: PgPool,
}

impl PgBulkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Register an uploaded file (upsert)
    pub async fn register_file(&self, file: &SourceFile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_files (id, company_id, name, storage_key, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, storage_key = EXCLUDED.storage_key, updated_at = NOW()
            "#,
        )
        .bind(file.id)
        .bind(file.company_id)
        .bind(&file.name)
        .bind(&file.storage_key)
        .bind(file.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl BulkRequestStore for PgBulkStore {
    #[instrument(skip(self, new), fields(request_id = %new.id))]
    async fn create(&self, new: &NewBulkRequest) -> Result<BulkRequest> {
        let sql = format!(
            r#"
            INSERT INTO bulk_requests
                (id, company_id, requested_by, file_id, file_name, processor, status, total_rows, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', $7, $8)
            RETURNING {}
            "#,
            REQUEST_COLUMNS
        );

        let row: RequestRow = sqlx::query_as(&sql)
            .bind(new.id)
            .bind(new.company_id)
            .bind(new.requested_by)
            .bind(new.file_id)
            .bind(&new.file_name)
            .bind(&new.processor)
            .bind(new.total_rows.map(to_i64))
            .bind(Json(&new.metadata))
            .fetch_one(&self.pool)
            .await?;

        Ok(row.into())
    }

    async fn load(&self, id: Uuid) -> Result<BulkRequest> {
        let sql = format!("SELECT {} FROM bulk_requests WHERE id = $1", REQUEST_COLUMNS);
        let row: Option<RequestRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(BulkRequest::from)
            .ok_or_else(|| BulkError::NotFound(format!("bulk request {}", id)))
    }

    #[instrument(skip(self, patch), fields(request_id = %id, from = %from, to = %to))]
    async fn transition(
        &self,
        id: Uuid,
        from: BulkStatus,
        to: BulkStatus,
        patch: &TransitionPatch,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bulk_requests
            SET status = $3,
                started_at = CASE WHEN $3 = 'PROCESSING' THEN COALESCE(started_at, NOW()) ELSE started_at END,
                completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END,
                error_message = COALESCE($5, error_message),
                progress = COALESCE($6, progress),
                total_rows = COALESCE($7, total_rows),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(to.is_terminal())
        .bind(patch.error_message.as_deref())
        .bind(patch.progress.map(i16::from))
        .bind(patch.total_rows.map(to_i64))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_progress(&self, id: Uuid, counters: &RowCounters) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE bulk_requests
            SET processed_rows = GREATEST(processed_rows, $2),
                successful_rows = GREATEST(successful_rows, $3),
                failed_rows = GREATEST(failed_rows, $4),
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(id)
        .bind(to_i64(counters.processed))
        .bind(to_i64(counters.successful))
        .bind(to_i64(counters.failed))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_progress(&self, id: Uuid, percent: u8) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE bulk_requests
            SET progress = $2, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(id)
        .bind(i16::from(percent.min(100)))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_row_logs(&self, id: Uuid, logs: &[RowLog], cap: usize) -> Result<usize> {
        if logs.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        // Serializes concurrent appenders on the cap
        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM bulk_requests WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(BulkError::NotFound(format!("bulk request {}", id)));
        }

        let (stored,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM bulk_request_rows WHERE request_id = $1")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        let room = cap.saturating_sub(usize::try_from(stored).unwrap_or(usize::MAX));
        let kept = logs.len().min(room);

        for log in &logs[..kept] {
            sqlx::query(
                r#"
                INSERT INTO bulk_request_rows
                    (request_id, row_number, entity_id, entity_type, errors, warnings, metadata, processed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(id)
            .bind(to_i64(log.row_number))
            .bind(log.entity_id.as_deref())
            .bind(&log.entity_type)
            .bind(Json(&log.errors))
            .bind(Json(&log.warnings))
            .bind(Json(&log.metadata))
            .bind(log.processed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(kept)
    }

    async fn row_logs(&self, id: Uuid) -> Result<Vec<RowLog>> {
        let rows: Vec<RowLogRow> = sqlx::query_as(
            r#"
            SELECT row_number, entity_id, entity_type, errors, warnings, metadata, processed_at
            FROM bulk_request_rows
            WHERE request_id = $1
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RowLog {
                row_number: to_u64(row.row_number),
                entity_id: row.entity_id,
                entity_type: row.entity_type,
                errors: row.errors.0,
                warnings: row.warnings.0,
                metadata: row.metadata.0,
                processed_at: row.processed_at,
            })
            .collect())
    }

    async fn merge_metadata(&self, id: Uuid, entries: Map<String, Value>) -> Result<()> {
        sqlx::query(
            "UPDATE bulk_requests SET metadata = metadata || $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(Json(&entries))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl SourceFileStore for PgBulkStore {
    async fn get(&self, id: Uuid) -> Result<SourceFile> {
        let row: Option<(Uuid, Uuid, String, String, String)> = sqlx::query_as(
            "SELECT id, company_id, name, storage_key, status FROM source_files WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, company_id, name, storage_key, status)| SourceFile {
            id,
            company_id,
            name,
            storage_key,
            status: FileStatus::from(status),
        })
        .ok_or_else(|| BulkError::NotFound(format!("source file {}", id)))
    }

    async fn set_status(&self, id: Uuid, status: FileStatus) -> Result<()> {
        let result =
            sqlx::query("UPDATE source_files SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(status.as_str())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(BulkError::NotFound(format!("source file {}", id)));
        }
        Ok(())
    }

    async fn mark_deleted(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE source_files SET status = 'deleted', deleted_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl QuotaLedger for PgBulkStore {
    async fn try_reserve(&self, user_id: Uuid, bytes: u64) -> Result<Reservation> {
        // The outer SELECT reads the pre-update snapshot
        let (reserved, remaining): (bool, Option<i64>) = sqlx::query_as(
            r#"
            WITH reserved AS (
                UPDATE user_storage_quotas
                SET used_bytes = used_bytes + $2, updated_at = NOW()
                WHERE user_id = $1 AND used_bytes + $2 <= limit_bytes
                RETURNING user_id
            )
            SELECT
                EXISTS (SELECT 1 FROM reserved),
                (SELECT GREATEST(limit_bytes - used_bytes, 0)
                 FROM user_storage_quotas WHERE user_id = $1)
            "#,
        )
        .bind(user_id)
        .bind(to_i64(bytes))
        .fetch_one(&self.pool)
        .await?;

        Ok(match (reserved, remaining) {
            (true, _) | (false, None) => Reservation::Granted,
            (false, Some(left)) => Reservation::Denied {
                remaining: to_u64(left),
            },
        })
    }

    async fn release(&self, user_id: Uuid, bytes: u64) -> Result<()> {
        sqlx::query(
            "UPDATE user_storage_quotas SET used_bytes = GREATEST(used_bytes - $2, 0), updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(to_i64(bytes))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_conversions_saturate() {
        assert_eq!(to_u64(-5), 0);
        assert_eq!(to_u64(42), 42);
        assert_eq!(to_i64(u64::MAX), i64::MAX);
    }
}
