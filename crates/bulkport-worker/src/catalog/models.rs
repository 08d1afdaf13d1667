use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::bulk::Row;

pub const MAX_SKU_LEN: usize = 64;
pub const MAX_MEDIA_PER_ROW: usize = 20;

/// Media state of a catalog item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    /// The row referenced no media
    None,
    /// Media URLs recorded, not transferred yet
    Pending,
    /// Every URL transferred
    Done,
    /// Some URLs failed; the item stays hidden
    Partial,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::None => "none",
            MediaStatus::Pending => "pending",
            MediaStatus::Done => "done",
            MediaStatus::Partial => "partial",
        }
    }
}

impl From<String> for MediaStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => MediaStatus::Pending,
            "done" => MediaStatus::Done,
            "partial" => MediaStatus::Partial,
            _ => MediaStatus::None,
        }
    }
}

impl fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: Uuid,
    pub company_id: Uuid,
    pub request_id: Uuid,
    pub row_number: u64,
    pub sku: String,
    pub title: String,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    /// Source URLs, kept until the media is transferred
    pub media_urls: Vec<String>,
    pub media_status: MediaStatus,
    pub visible: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCatalogItem {
    pub company_id: Uuid,
    pub request_id: Uuid,
    pub row_number: u64,
    pub sku: String,
    pub title: String,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub media_urls: Vec<String>,
}

impl NewCatalogItem {
    pub fn media_status(&self) -> MediaStatus {
        if self.media_urls.is_empty() {
            MediaStatus::None
        } else {
            MediaStatus::Pending
        }
    }

    /// Items without media are visible right away
    pub fn visible(&self) -> bool {
        self.media_urls.is_empty()
    }
}

/// A stored media object attached to an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogMedia {
    pub id: Uuid,
    pub item_id: Uuid,
    pub storage_key: String,
    pub original_url: String,
    pub mime_type: Option<String>,
    pub size: u64,
    pub checksum: Option<String>,
    pub position: u32,
}

/// Validated columns of one catalog row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRow {
    pub sku: String,
    pub title: String,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub media_urls: Vec<String>,
}

impl CatalogRow {
    pub const COLUMNS: [&'static str; 5] = ["sku", "title", "description", "price", "media_urls"];

    /// Validate a row, collecting every problem
    pub fn parse(row: &Row) -> Result<Self, Vec<String>> {
        let cell = |name: &str| row.get(name).map(|v| v.trim()).unwrap_or_default();
        let mut errors = Vec::new();

        let sku = cell("sku");
        if sku.is_empty() {
            errors.push("sku is required".to_string());
        } else if sku.chars().count() > MAX_SKU_LEN {
            errors.push(format!("sku exceeds {} characters", MAX_SKU_LEN));
        } else if !sku
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            || !sku.chars().any(|c| c.is_ascii_alphanumeric())
        {
            errors.push(format!(
                "sku '{}' may only contain letters, digits, '-', '_' and '.'",
                sku
            ));
        }

        let title = cell("title");
        if title.is_empty() {
            errors.push("title is required".to_string());
        }

        let price_cents = match cell("price") {
            "" => None,
            raw => match parse_price_cents(raw) {
                Ok(cents) => Some(cents),
                Err(e) => {
                    errors.push(e);
                    None
                },
            },
        };

        let media_urls: Vec<String> = cell("media_urls")
            .split(|c: char| c == '|' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if media_urls.len() > MAX_MEDIA_PER_ROW {
            errors.push(format!(
                "at most {} media URLs per row, found {}",
                MAX_MEDIA_PER_ROW,
                media_urls.len()
            ));
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let description = Some(cell("description"))
            .filter(|d| !d.is_empty())
            .map(str::to_string);

        Ok(Self {
            sku: sku.to_string(),
            title: title.to_string(),
            description,
            price_cents,
            media_urls,
        })
    }
}

/// `"12.5"` → 1250; at most two decimals, never negative
pub fn parse_price_cents(raw: &str) -> Result<i64, String> {
    let invalid = || format!("price '{}' is not a non-negative amount", raw);

    let (whole, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit())
        || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }
    if fraction.len() > 2 {
        return Err(format!("price '{}' has more than two decimals", raw));
    }

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let cents: i64 = format!("{:0<2}", fraction).parse().map_err(|_| invalid())?;

    whole
        .checked_mul(100)
        .and_then(|w| w.checked_add(cents))
        .ok_or_else(invalid)
}
