use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Sticker {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub tags: Vec<String>,
    pub image_url: String,
    pub thumbnail_url: Option<String>,
    pub source_url: Option<String>,
    pub file_size: Option<i64>,
    pub file_format: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub download_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StickerSort {
    Newest,
    Popular,
    Name,
}

impl Default for StickerSort {
    fn default() -> Self {
        Self::Newest
    }
}

impl StickerSort {
    pub fn order_clause(self) -> &'static str {
        match self {
            StickerSort::Newest => "created_at DESC",
            StickerSort::Popular => "download_count DESC, created_at DESC",
            StickerSort::Name => "name ASC",
        }
    }
}

/// Fields an admin may change on an existing sticker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StickerUpdate {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Image assets produced for a newly uploaded sticker.
#[derive(Debug, Clone)]
pub struct NewSticker {
    pub name: String,
    pub slug: String,
    pub tags: Vec<String>,
    pub image_url: String,
    pub thumbnail_url: Option<String>,
    pub source_url: Option<String>,
    pub file_size: i64,
    pub file_format: String,
    pub width: i32,
    pub height: i32,
}
