use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DownloadRecord {
    pub id: Uuid,
    pub sticker_id: Uuid,
    pub ip_hash: String,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A download event before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDownloadRecord {
    pub sticker_id: Uuid,
    pub ip_hash: String,
    pub user_agent: Option<String>,
}
