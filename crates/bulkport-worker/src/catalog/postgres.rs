use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use super::models::{CatalogItem, CatalogMedia, MediaStatus, NewCatalogItem};
use super::repository::CatalogRepository;
use crate::bulk::{BulkError, Result};

const ITEM_COLUMNS: &str = "id, company_id, request_id, row_number, sku, title, description, \
     price_cents, media_urls, media_status, visible, created_at";

#[derive(FromRow)]
struct ItemRow {
    id: Uuid,
    company_id: Uuid,
    request_id: Uuid,
    row_number: i64,
    sku: String,
    title: String,
    description: Option<String>,
    price_cents: Option<i64>,
    media_urls: Json<Vec<String>>,
    media_status: String,
    visible: bool,
    created_at: DateTime<Utc>,
}

impl From<ItemRow> for CatalogItem {
    fn from(row: ItemRow) -> Self {
        CatalogItem {
            id: row.id,
            company_id: row.company_id,
            request_id: row.request_id,
            row_number: u64::try_from(row.row_number).unwrap_or(0),
            sku: row.sku,
            title: row.title,
            description: row.description,
            price_cents: row.price_cents,
            media_urls: row.media_urls.0,
            media_status: MediaStatus::from(row.media_status),
            visible: row.visible,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct MediaRow {
    id: Uuid,
    item_id: Uuid,
    storage_key: String,
    original_url: String,
    mime_type: Option<String>,
    size_bytes: i64,
    checksum: Option<String>,
    position: i32,
}

impl From<MediaRow> for CatalogMedia {
    fn from(row: MediaRow) -> Self {
        CatalogMedia {
            id: row.id,
            item_id: row.item_id,
            storage_key: row.storage_key,
            original_url: row.original_url,
            mime_type: row.mime_type,
            size: u64::try_from(row.size_bytes).unwrap_or(0),
            checksum: row.checksum,
            position: u32::try_from(row.position).unwrap_or(0),
        }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Catalog items in `catalog_items`, media in `catalog_media`
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogRepository for PgCatalog {
    async fn sku_exists(&self, company_id: Uuid, sku: &str) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM catalog_items WHERE company_id = $1 AND sku = $2)",
        )
        .bind(company_id)
        .bind(sku)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    #[instrument(skip(self, item), fields(request_id = %item.request_id, sku = %item.sku))]
    async fn insert_item(&self, item: &NewCatalogItem) -> Result<CatalogItem> {
        let sql = format!(
            r#"
            INSERT INTO catalog_items
                (id, company_id, request_id, row_number, sku, title, description,
                 price_cents, media_urls, media_status, visible)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (company_id, sku) DO NOTHING
            RETURNING {}
            "#,
            ITEM_COLUMNS
        );

        let row: Option<ItemRow> = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(item.company_id)
            .bind(item.request_id)
            .bind(to_i64(item.row_number))
            .bind(&item.sku)
            .bind(&item.title)
            .bind(item.description.as_deref())
            .bind(item.price_cents)
            .bind(Json(&item.media_urls))
            .bind(item.media_status().as_str())
            .bind(item.visible())
            .fetch_optional(&self.pool)
            .await?;

        row.map(CatalogItem::from)
            .ok_or_else(|| BulkError::Persistence(format!("duplicate sku '{}'", item.sku)))
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<CatalogItem>> {
        let sql = format!("SELECT {} FROM catalog_items WHERE id = $1", ITEM_COLUMNS);
        let row: Option<ItemRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(CatalogItem::from))
    }

    async fn attach_media(&self, item_id: Uuid, media: &[CatalogMedia]) -> Result<()> {
        if media.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for m in media {
            sqlx::query(
                r#"
                INSERT INTO catalog_media
                    (id, item_id, storage_key, original_url, mime_type, size_bytes, checksum, position)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(m.id)
            .bind(item_id)
            .bind(&m.storage_key)
            .bind(&m.original_url)
            .bind(m.mime_type.as_deref())
            .bind(to_i64(m.size))
            .bind(m.checksum.as_deref())
            .bind(i32::try_from(m.position).unwrap_or(i32::MAX))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn set_media_result(&self, item_id: Uuid, status: MediaStatus, visible: bool) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE catalog_items
            SET media_status = $2,
                visible = $3,
                media_urls = CASE WHEN $2 = 'pending' THEN media_urls ELSE '[]'::jsonb END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(status.as_str())
        .bind(visible)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BulkError::NotFound(format!("catalog item {}", item_id)));
        }
        Ok(())
    }

    async fn count_pending_media(&self, request_id: Uuid) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM catalog_items WHERE request_id = $1 AND media_status = 'pending'",
        )
        .bind(request_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn pending_media_page(
        &self,
        request_id: Uuid,
        after_row: Option<u64>,
        limit: usize,
    ) -> Result<Vec<CatalogItem>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM catalog_items
            WHERE request_id = $1
              AND media_status = 'pending'
              AND row_number > $2
            ORDER BY row_number
            LIMIT $3
            "#,
            ITEM_COLUMNS
        );

        let rows: Vec<ItemRow> = sqlx::query_as(&sql)
            .bind(request_id)
            .bind(after_row.map(to_i64).unwrap_or(-1))
            .bind(to_limit(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(CatalogItem::from).collect())
    }

    async fn items_for_request(&self, request_id: Uuid, limit: usize) -> Result<Vec<CatalogItem>> {
        let sql = format!(
            "SELECT {} FROM catalog_items WHERE request_id = $1 ORDER BY row_number LIMIT $2",
            ITEM_COLUMNS
        );

        let rows: Vec<ItemRow> = sqlx::query_as(&sql)
            .bind(request_id)
            .bind(to_limit(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(CatalogItem::from).collect())
    }

    async fn media_for_items(&self, item_ids: &[Uuid]) -> Result<Vec<CatalogMedia>> {
        let rows: Vec<MediaRow> = sqlx::query_as(
            r#"
            SELECT id, item_id, storage_key, original_url, mime_type, size_bytes, checksum, position
            FROM catalog_media
            WHERE item_id = ANY($1)
            ORDER BY item_id, position
            "#,
        )
        .bind(item_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CatalogMedia::from).collect())
    }

    /// `catalog_media` rows go with their item (ON DELETE CASCADE)
    async fn delete_items(&self, item_ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM catalog_items WHERE id = ANY($1)")
            .bind(item_ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
