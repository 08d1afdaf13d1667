use async_trait::async_trait;
use bulkport_common::ResourcePath;
use sqlx::PgPool;
use std::time::Duration;
use tracing::instrument;

use super::store::{ConflictProbe, LockStore};
use super::{LockError, LockKey, LockResult};

/// Longest TTL written to the table; larger values would overflow the
/// `INTERVAL` arithmetic
pub const MAX_LOCK_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Lock store backed by the `resource_locks` table
///
/// Acquisition is one `INSERT .. ON CONFLICT DO UPDATE .. WHERE expired`
/// statement, so the row-level conflict check and the write are atomic.
#[derive(Debug, Clone)]
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Remove rows that expired more than `grace` ago
    pub async fn purge_expired(&self, grace: Duration) -> LockResult<u64> {
        let result = sqlx::query(
            "DELETE FROM resource_locks WHERE expires_at < NOW() - $1::bigint * INTERVAL '1 millisecond'",
        )
        .bind(ttl_millis(grace))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    // MAX_LOCK_TTL in milliseconds always fits an i64
    i64::try_from(ttl.min(MAX_LOCK_TTL).as_millis()).unwrap_or(i64::MAX)
}

/// `LIKE` pattern matching every path strictly below `root`
fn subtree_pattern(root: &ResourcePath) -> String {
    if root.is_root() {
        return "/%".to_string();
    }
    let escaped = root
        .as_str()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{}/%", escaped)
}

#[async_trait]
impl LockStore for PgLockStore {
    #[instrument(skip(self, token), fields(lock = %key))]
    async fn try_acquire(&self, key: &LockKey, token: &str, ttl: Duration) -> LockResult<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO resource_locks (namespace, path, token, expires_at, acquired_at)
            VALUES ($1, $2, $3, NOW() + $4::bigint * INTERVAL '1 millisecond', NOW())
            ON CONFLICT (namespace, path) DO UPDATE
            SET token = EXCLUDED.token,
                expires_at = EXCLUDED.expires_at,
                acquired_at = EXCLUDED.acquired_at
            WHERE resource_locks.expires_at <= NOW()
               OR resource_locks.token = EXCLUDED.token
            RETURNING token
            "#,
        )
        .bind(&key.namespace)
        .bind(key.path.as_str())
        .bind(token)
        .bind(ttl_millis(ttl))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    #[instrument(skip(self, token), fields(lock = %key))]
    async fn refresh(&self, key: &LockKey, token: &str, ttl: Duration) -> LockResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE resource_locks
            SET expires_at = NOW() + $4::bigint * INTERVAL '1 millisecond'
            WHERE namespace = $1 AND path = $2 AND token = $3 AND expires_at > NOW()
            "#,
        )
        .bind(&key.namespace)
        .bind(key.path.as_str())
        .bind(token)
        .bind(ttl_millis(ttl))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, token), fields(lock = %key))]
    async fn release(&self, key: &LockKey, token: &str) -> LockResult<bool> {
        let result = sqlx::query(
            "DELETE FROM resource_locks WHERE namespace = $1 AND path = $2 AND token = $3",
        )
        .bind(&key.namespace)
        .bind(key.path.as_str())
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_conflicts(
        &self,
        namespace: &str,
        probe: &ConflictProbe,
        token: &str,
    ) -> LockResult<Vec<ResourcePath>> {
        let ancestors: Vec<String> = probe
            .ancestors
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT path FROM resource_locks
            WHERE namespace = $1
              AND token <> $2
              AND expires_at > NOW()
              AND (path = ANY($3) OR path LIKE $4 ESCAPE '\')
            ORDER BY path
            "#,
        )
        .bind(namespace)
        .bind(token)
        .bind(&ancestors)
        .bind(subtree_pattern(&probe.subtree_root))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(path,)| ResourcePath::parse(&path).map_err(LockError::from))
            .collect()
    }
}
