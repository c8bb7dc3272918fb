use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Sticker;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Pack {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    #[sqlx(rename = "character_name")]
    pub character: Option<String>,
    pub thumbnail_url: Option<String>,
    pub display_order: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A pack row plus the number of join rows pointing at it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PackSummary {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub pack: Pack,
    pub sticker_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackWithStickers {
    #[serde(flatten)]
    pub pack: Pack,
    pub sticker_count: i64,
    pub stickers: Vec<Sticker>,
}
