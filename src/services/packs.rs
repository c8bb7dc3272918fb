use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{Pack, PackSummary, PackWithStickers, Sticker},
    storage::{
        bucket::{extension_from_content_type, AssetPrefix, BucketClient},
        redis::RedisClient,
    },
};

const ACTIVE_PACKS_CACHE: &str = "packs:active";

#[derive(Debug, Deserialize)]
pub struct CreatePackRequest {
    pub name: String,
    pub description: Option<String>,
    pub character: Option<String>,
    pub display_order: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdatePackRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub character: Option<String>,
    pub display_order: Option<i32>,
    pub is_active: Option<bool>,
}

pub struct PacksService {
    db: PgPool,
    redis: RedisClient,
    cache_ttl: Duration,
}

impl PacksService {
    pub fn new(db: PgPool, redis: RedisClient, cache_ttl: Duration) -> Self {
        Self {
            db,
            redis,
            cache_ttl,
        }
    }

    /// Public pack listing, served from the catalog cache when warm.
    pub async fn list_active(&self) -> AppResult<Vec<PackSummary>> {
        match self.redis.get_cached::<Vec<PackSummary>>(ACTIVE_PACKS_CACHE).await {
            Ok(Some(packs)) => return Ok(packs),
            Ok(None) => {}
            Err(e) => tracing::warn!("Catalog cache read failed: {}", e),
        }

        let packs = self.summaries(true).await?;

        if let Err(e) = self
            .redis
            .set_cached(ACTIVE_PACKS_CACHE, &packs, self.cache_ttl)
            .await
        {
            tracing::warn!("Catalog cache write failed: {}", e);
        }

        Ok(packs)
    }

    /// Every pack, including inactive ones (admin)
    pub async fn list_all(&self) -> AppResult<Vec<PackSummary>> {
        self.summaries(false).await
    }

    async fn summaries(&self, active_only: bool) -> AppResult<Vec<PackSummary>> {
        let packs: Vec<PackSummary> = sqlx::query_as(
            r#"
            SELECT p.*, COUNT(pi.sticker_id) AS sticker_count
            FROM packs p
            LEFT JOIN pack_items pi ON pi.pack_id = p.id
            WHERE p.is_active OR NOT $1
            GROUP BY p.id
            ORDER BY p.display_order ASC, p.created_at ASC
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.db)
        .await?;

        Ok(packs)
    }

    pub async fn get(&self, pack_id: Uuid) -> AppResult<Pack> {
        let pack: Option<Pack> = sqlx::query_as("SELECT * FROM packs WHERE id = $1")
            .bind(pack_id)
            .fetch_optional(&self.db)
            .await?;

        pack.ok_or(AppError::PackNotFound)
    }

    /// Pack detail with its stickers in pack order
    pub async fn get_with_stickers(&self, pack_id: Uuid) -> AppResult<PackWithStickers> {
        let pack = self.get(pack_id).await?;

        let stickers: Vec<Sticker> = sqlx::query_as(
            r#"
            SELECT s.*
            FROM stickers s
            INNER JOIN pack_items pi ON pi.sticker_id = s.id
            WHERE pi.pack_id = $1
            ORDER BY pi.display_order ASC, s.created_at ASC
            "#,
        )
        .bind(pack_id)
        .fetch_all(&self.db)
        .await?;

        Ok(PackWithStickers {
            pack,
            sticker_count: stickers.len() as i64,
            stickers,
        })
    }

    pub async fn create(&self, req: CreatePackRequest) -> AppResult<Pack> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Pack name is required".to_string()));
        }

        let display_order = match req.display_order {
            Some(order) => order,
            None => {
                sqlx::query_scalar::<_, i32>("SELECT COALESCE(MAX(display_order) + 1, 0) FROM packs")
                    .fetch_one(&self.db)
                    .await?
            }
        };

        let pack: Pack = sqlx::query_as(
            r#"
            INSERT INTO packs (id, name, description, character_name, display_order, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(&req.description)
        .bind(&req.character)
        .bind(display_order)
        .bind(req.is_active.unwrap_or(true))
        .fetch_one(&self.db)
        .await?;

        self.invalidate().await;
        tracing::info!("Created pack {} ({})", pack.name, pack.id);
        Ok(pack)
    }

    pub async fn update(&self, pack_id: Uuid, req: UpdatePackRequest) -> AppResult<Pack> {
        if matches!(req.name.as_deref().map(str::trim), Some("")) {
            return Err(AppError::Validation("Pack name cannot be empty".to_string()));
        }

        let pack: Option<Pack> = sqlx::query_as(
            r#"
            UPDATE packs
            SET name = COALESCE($1, name),
                description = COALESCE($2, description),
                character_name = COALESCE($3, character_name),
                display_order = COALESCE($4, display_order),
                is_active = COALESCE($5, is_active),
                updated_at = NOW()
            WHERE id = $6
            RETURNING *
            "#,
        )
        .bind(req.name.as_deref().map(str::trim))
        .bind(&req.description)
        .bind(&req.character)
        .bind(req.display_order)
        .bind(req.is_active)
        .bind(pack_id)
        .fetch_optional(&self.db)
        .await?;

        let pack = pack.ok_or(AppError::PackNotFound)?;
        self.invalidate().await;
        Ok(pack)
    }

    pub async fn delete(&self, pack_id: Uuid) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM packs WHERE id = $1")
            .bind(pack_id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::PackNotFound);
        }

        self.invalidate().await;
        Ok(())
    }

    /// Replace the pack's stickers with `sticker_ids`, in that order.
    pub async fn set_items(&self, pack_id: Uuid, sticker_ids: &[Uuid]) -> AppResult<PackWithStickers> {
        let sticker_ids = dedup_ids(sticker_ids);
        self.get(pack_id).await?;

        let known: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stickers WHERE id = ANY($1)")
            .bind(&sticker_ids)
            .fetch_one(&self.db)
            .await?;
        if known != sticker_ids.len() as i64 {
            return Err(AppError::Validation(format!(
                "{} of the selected stickers do not exist",
                sticker_ids.len() as i64 - known
            )));
        }

        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM pack_items WHERE pack_id = $1")
            .bind(pack_id)
            .execute(&mut *tx)
            .await?;

        for (order, sticker_id) in sticker_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO pack_items (pack_id, sticker_id, display_order) VALUES ($1, $2, $3)",
            )
            .bind(pack_id)
            .bind(sticker_id)
            .bind(order as i32)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE packs SET updated_at = NOW() WHERE id = $1")
            .bind(pack_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.invalidate().await;
        self.get_with_stickers(pack_id).await
    }

    /// Set pack display order to the position of each id in `pack_ids`.
    pub async fn reorder(&self, pack_ids: &[Uuid]) -> AppResult<()> {
        let pack_ids = dedup_ids(pack_ids);
        let mut tx = self.db.begin().await?;

        for (order, pack_id) in pack_ids.iter().enumerate() {
            let result = sqlx::query(
                "UPDATE packs SET display_order = $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(order as i32)
            .bind(pack_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(AppError::PackNotFound);
            }
        }

        tx.commit().await?;
        self.invalidate().await;
        Ok(())
    }

    pub async fn upload_thumbnail(
        &self,
        bucket: &BucketClient,
        pack_id: Uuid,
        data: Bytes,
        content_type: &str,
    ) -> AppResult<Pack> {
        self.get(pack_id).await?;

        let key = AssetPrefix::Packs.key(&format!(
            "{}/thumbnail.{}",
            pack_id,
            extension_from_content_type(content_type)
        ));
        let url = bucket.upload(&key, data, content_type).await?;

        let pack: Pack = sqlx::query_as(
            "UPDATE packs SET thumbnail_url = $1, updated_at = NOW() WHERE id = $2 RETURNING *",
        )
        .bind(&url)
        .bind(pack_id)
        .fetch_one(&self.db)
        .await?;

        self.invalidate().await;
        Ok(pack)
    }

    async fn invalidate(&self) {
        if let Err(e) = self.redis.invalidate_catalog().await {
            tracing::warn!("Failed to invalidate catalog cache: {}", e);
        }
    }
}

fn dedup_ids(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(dedup_ids(&[b, a, b, a]), vec![b, a]);
    }
}
