use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::models::{CatalogItem, CatalogMedia, MediaStatus, NewCatalogItem};
use crate::bulk::{BulkError, Result};

/// Persistence of catalog items and their media
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn sku_exists(&self, company_id: Uuid, sku: &str) -> Result<bool>;

    async fn insert_item(&self, item: &NewCatalogItem) -> Result<CatalogItem>;

    async fn get_item(&self, id: Uuid) -> Result<Option<CatalogItem>>;

    async fn attach_media(&self, item_id: Uuid, media: &[CatalogMedia]) -> Result<()>;

    /// Record the media outcome; the stored URL list is dropped once settled
    async fn set_media_result(&self, item_id: Uuid, status: MediaStatus, visible: bool) -> Result<()>;

    async fn count_pending_media(&self, request_id: Uuid) -> Result<u64>;

    /// Pending items ordered by row number, strictly after `after_row`
    async fn pending_media_page(
        &self,
        request_id: Uuid,
        after_row: Option<u64>,
        limit: usize,
    ) -> Result<Vec<CatalogItem>>;

    /// Up to `limit` items created by a request
    async fn items_for_request(&self, request_id: Uuid, limit: usize) -> Result<Vec<CatalogItem>>;

    async fn media_for_items(&self, item_ids: &[Uuid]) -> Result<Vec<CatalogMedia>>;

    /// Delete items and their media records
    async fn delete_items(&self, item_ids: &[Uuid]) -> Result<u64>;
}

#[derive(Debug, Default)]
struct State {
    items: BTreeMap<Uuid, CatalogItem>,
    media: Vec<CatalogMedia>,
}

/// In-process catalog for tests and local runs
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<State>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every item of a request ordered by row number
    pub fn items(&self, request_id: Uuid) -> Vec<CatalogItem> {
        let mut items: Vec<CatalogItem> = self
            .lock()
            .items
            .values()
            .filter(|i| i.request_id == request_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.row_number);
        items
    }

    pub fn media_of(&self, item_id: Uuid) -> Vec<CatalogMedia> {
        self.lock()
            .media
            .iter()
            .filter(|m| m.item_id == item_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CatalogRepository for MemoryCatalog {
    async fn sku_exists(&self, company_id: Uuid, sku: &str) -> Result<bool> {
        Ok(self
            .lock()
            .items
            .values()
            .any(|i| i.company_id == company_id && i.sku == sku))
    }

    async fn insert_item(&self, item: &NewCatalogItem) -> Result<CatalogItem> {
        let mut state = self.lock();
        if state
            .items
            .values()
            .any(|i| i.company_id == item.company_id && i.sku == item.sku)
        {
            return Err(BulkError::Persistence(format!(
                "duplicate sku '{}'",
                item.sku
            )));
        }

        let stored = CatalogItem {
            id: Uuid::new_v4(),
            company_id: item.company_id,
            request_id: item.request_id,
            row_number: item.row_number,
            sku: item.sku.clone(),
            title: item.title.clone(),
            description: item.description.clone(),
            price_cents: item.price_cents,
            media_urls: item.media_urls.clone(),
            media_status: item.media_status(),
            visible: item.visible(),
            created_at: Utc::now(),
        };
        state.items.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<CatalogItem>> {
        Ok(self.lock().items.get(&id).cloned())
    }

    async fn attach_media(&self, item_id: Uuid, media: &[CatalogMedia]) -> Result<()> {
        let mut state = self.lock();
        if !state.items.contains_key(&item_id) {
            return Err(BulkError::NotFound(format!("catalog item {}", item_id)));
        }
        state.media.extend(media.iter().cloned());
        Ok(())
    }

    async fn set_media_result(&self, item_id: Uuid, status: MediaStatus, visible: bool) -> Result<()> {
        let mut state = self.lock();
        let item = state
            .items
            .get_mut(&item_id)
            .ok_or_else(|| BulkError::NotFound(format!("catalog item {}", item_id)))?;
        item.media_status = status;
        item.visible = visible;
        if status != MediaStatus::Pending {
            item.media_urls.clear();
        }
        Ok(())
    }

    async fn count_pending_media(&self, request_id: Uuid) -> Result<u64> {
        Ok(self
            .lock()
            .items
            .values()
            .filter(|i| i.request_id == request_id && i.media_status == MediaStatus::Pending)
            .count() as u64)
    }

    async fn pending_media_page(
        &self,
        request_id: Uuid,
        after_row: Option<u64>,
        limit: usize,
    ) -> Result<Vec<CatalogItem>> {
        let mut page: Vec<CatalogItem> = self
            .lock()
            .items
            .values()
            .filter(|i| {
                i.request_id == request_id
                    && i.media_status == MediaStatus::Pending
                    && after_row.map_or(true, |after| i.row_number > after)
            })
            .cloned()
            .collect();
        page.sort_by_key(|i| i.row_number);
        page.truncate(limit);
        Ok(page)
    }

    async fn items_for_request(&self, request_id: Uuid, limit: usize) -> Result<Vec<CatalogItem>> {
        let mut items = self.items(request_id);
        items.truncate(limit);
        Ok(items)
    }

    async fn media_for_items(&self, item_ids: &[Uuid]) -> Result<Vec<CatalogMedia>> {
        Ok(self
            .lock()
            .media
            .iter()
            .filter(|m| item_ids.contains(&m.item_id))
            .cloned()
            .collect())
    }

    async fn delete_items(&self, item_ids: &[Uuid]) -> Result<u64> {
        let mut state = self.lock();
        state.media.retain(|m| !item_ids.contains(&m.item_id));
        let removed = item_ids
            .iter()
            .filter(|id| state.items.remove(id).is_some())
            .count();
        Ok(removed as u64)
    }
}
