//! Media catalog workload
//!
//! The [`MediaCatalogProcessor`] imports catalog items from a sheet with
//! the columns `sku`, `title`, `description`, `price` and `media_urls`, and
//! re-hosts every referenced media file in object storage.

mod models;
mod postgres;
mod processor;
mod repository;

pub use models::{
    parse_price_cents, CatalogItem, CatalogMedia, CatalogRow, MediaStatus, NewCatalogItem,
    MAX_MEDIA_PER_ROW, MAX_SKU_LEN,
};
pub use postgres::PgCatalog;
pub use processor::{media_folder, CatalogSettings, MediaCatalogProcessor, ENTITY_TYPE, PROCESSOR_NAME};
pub use repository::{CatalogRepository, MemoryCatalog};
