use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    imaging::prepare_assets,
    models::{NewSticker, Sticker, StickerSort, StickerUpdate},
    packaging::sanitize_filename,
    storage::bucket::{content_type_for_extension, AssetPrefix, BucketClient},
};

const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StickerQuery {
    pub q: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub sort: StickerSort,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BulkDeleteReport {
    pub deleted: Vec<Uuid>,
    pub storage_errors: Vec<String>,
}

pub struct StickersService {
    db: PgPool,
    bucket: BucketClient,
}

impl StickersService {
    pub fn new(db: PgPool, bucket: BucketClient) -> Self {
        Self { db, bucket }
    }

    /// List stickers with optional search, tag filter and ordering
    pub async fn list(&self, query: &StickerQuery) -> AppResult<Vec<Sticker>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM stickers WHERE TRUE");

        if let Some(q) = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let pattern = format!("%{}%", q.to_lowercase());
            builder
                .push(" AND (LOWER(name) LIKE ")
                .push_bind(pattern.clone())
                .push(" OR EXISTS (SELECT 1 FROM unnest(tags) AS t WHERE LOWER(t) LIKE ")
                .push_bind(pattern)
                .push("))");
        }

        if let Some(tag) = query.tag.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            builder
                .push(" AND ")
                .push_bind(tag.to_lowercase())
                .push(" = ANY(tags)");
        }

        builder
            .push(" ORDER BY ")
            .push(query.sort.order_clause())
            .push(" LIMIT ")
            .push_bind(query.limit.unwrap_or(50).clamp(1, MAX_PAGE_SIZE))
            .push(" OFFSET ")
            .push_bind(query.offset.unwrap_or(0).max(0));

        let stickers = builder
            .build_query_as::<Sticker>()
            .fetch_all(&self.db)
            .await?;

        Ok(stickers)
    }

    pub async fn get(&self, sticker_id: Uuid) -> AppResult<Sticker> {
        let sticker: Option<Sticker> = sqlx::query_as("SELECT * FROM stickers WHERE id = $1")
            .bind(sticker_id)
            .fetch_optional(&self.db)
            .await?;

        sticker.ok_or(AppError::StickerNotFound)
    }

    pub async fn get_by_slug(&self, slug: &str) -> AppResult<Sticker> {
        let sticker: Option<Sticker> = sqlx::query_as("SELECT * FROM stickers WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.db)
            .await?;

        sticker.ok_or(AppError::StickerNotFound)
    }

    /// Fetch several stickers, keeping the order of `ids`. Unknown ids are
    /// silently dropped.
    pub async fn get_many(&self, ids: &[Uuid]) -> AppResult<Vec<Sticker>> {
        let stickers: Vec<Sticker> = sqlx::query_as("SELECT * FROM stickers WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.db)
            .await?;

        Ok(order_by_ids(stickers, ids))
    }

    pub async fn slug_exists(&self, slug: &str) -> AppResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM stickers WHERE slug = $1)")
                .bind(slug)
                .fetch_one(&self.db)
                .await?;

        Ok(exists)
    }

    /// Returns `base` if free, otherwise `base` with a short random suffix.
    pub async fn unique_slug(&self, base: &str) -> AppResult<String> {
        if !self.slug_exists(base).await? {
            return Ok(base.to_string());
        }

        for _ in 0..5 {
            let suffix: u16 = rand::thread_rng().gen();
            let candidate = format!("{}-{:04x}", base, suffix);
            if !self.slug_exists(&candidate).await? {
                return Ok(candidate);
            }
        }

        Err(AppError::SlugTaken(base.to_string()))
    }

    /// Upload a new sticker (admin): stores the original plus WebP display
    /// and thumbnail renditions, then inserts the row.
    pub async fn create(
        &self,
        name: &str,
        slug: &str,
        tags: &[String],
        data: Bytes,
    ) -> AppResult<Sticker> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Sticker name is required".to_string()));
        }
        if self.slug_exists(slug).await? {
            return Err(AppError::SlugTaken(slug.to_string()));
        }

        let file_size = data.len() as i64;
        let source = data.clone();
        let assets = tokio::task::spawn_blocking(move || prepare_assets(&source))
            .await
            .map_err(|e| anyhow::anyhow!("Image processing task failed: {}", e))??;

        let source_key = AssetPrefix::Source.key(&format!("{}.{}", slug, assets.source_extension));
        let source_url = self
            .bucket
            .upload(
                &source_key,
                data,
                content_type_for_extension(assets.source_extension),
            )
            .await?;

        let webp_key = AssetPrefix::Webp.key(&format!("{}.webp", slug));
        let image_url = self
            .bucket
            .upload(&webp_key, Bytes::from(assets.display_webp), "image/webp")
            .await?;

        let thumb_key = AssetPrefix::Thumbnails.key(&format!("{}.webp", slug));
        let thumbnail_url = self
            .bucket
            .upload(&thumb_key, Bytes::from(assets.thumbnail_webp), "image/webp")
            .await?;

        self.insert(NewSticker {
            name: name.to_string(),
            slug: slug.to_string(),
            tags: normalize_tags(tags),
            image_url,
            thumbnail_url: Some(thumbnail_url),
            source_url: Some(source_url),
            file_size,
            file_format: assets.source_extension.to_string(),
            width: assets.width as i32,
            height: assets.height as i32,
        })
        .await
    }

    async fn insert(&self, new: NewSticker) -> AppResult<Sticker> {
        let sticker: Sticker = sqlx::query_as(
            r#"
            INSERT INTO stickers (id, name, slug, tags, image_url, thumbnail_url, source_url,
                                  file_size, file_format, width, height, download_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.slug)
        .bind(&new.tags)
        .bind(&new.image_url)
        .bind(&new.thumbnail_url)
        .bind(&new.source_url)
        .bind(new.file_size)
        .bind(&new.file_format)
        .bind(new.width)
        .bind(new.height)
        .fetch_one(&self.db)
        .await?;

        tracing::info!("Created sticker {} ({})", sticker.slug, sticker.id);
        Ok(sticker)
    }

    /// Edit name, slug or tags (admin)
    pub async fn update(&self, sticker_id: Uuid, update: StickerUpdate) -> AppResult<Sticker> {
        let name = match update.name.as_deref().map(str::trim) {
            Some("") => {
                return Err(AppError::Validation("Sticker name cannot be empty".to_string()))
            }
            other => other.map(str::to_string),
        };

        let slug = update.slug.as_deref().map(slugify);
        if let Some(slug) = &slug {
            let taken: Option<Uuid> =
                sqlx::query_scalar("SELECT id FROM stickers WHERE slug = $1 AND id <> $2")
                    .bind(slug)
                    .bind(sticker_id)
                    .fetch_optional(&self.db)
                    .await?;
            if taken.is_some() {
                return Err(AppError::SlugTaken(slug.clone()));
            }
        }

        let tags = update.tags.as_deref().map(normalize_tags);

        let sticker: Option<Sticker> = sqlx::query_as(
            r#"
            UPDATE stickers
            SET name = COALESCE($1, name),
                slug = COALESCE($2, slug),
                tags = COALESCE($3, tags),
                updated_at = NOW()
            WHERE id = $4
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(slug)
        .bind(tags)
        .bind(sticker_id)
        .fetch_optional(&self.db)
        .await?;

        sticker.ok_or(AppError::StickerNotFound)
    }

    /// Update a sticker located by slug; used by the metadata importer.
    pub async fn update_by_slug(&self, slug: &str, update: StickerUpdate) -> AppResult<Sticker> {
        let sticker = self.get_by_slug(slug).await?;
        self.update(sticker.id, update).await
    }

    /// Delete stickers and, best effort, their stored images (admin)
    pub async fn bulk_delete(&self, ids: &[Uuid]) -> AppResult<BulkDeleteReport> {
        if ids.is_empty() {
            return Err(AppError::Validation("No stickers selected".to_string()));
        }

        let removed: Vec<Sticker> =
            sqlx::query_as("DELETE FROM stickers WHERE id = ANY($1) RETURNING *")
                .bind(ids)
                .fetch_all(&self.db)
                .await?;

        let mut storage_errors = Vec::new();
        for sticker in &removed {
            let urls = [
                Some(sticker.image_url.as_str()),
                sticker.thumbnail_url.as_deref(),
                sticker.source_url.as_deref(),
            ];
            for url in urls.into_iter().flatten() {
                let Some(key) = self.bucket.key_from_url(url) else {
                    continue;
                };
                if let Err(e) = self.bucket.delete(key).await {
                    tracing::warn!("Failed to delete {} for sticker {}: {}", key, sticker.id, e);
                    storage_errors.push(format!("{}: {}", key, e));
                }
            }
        }

        tracing::info!("Deleted {} stickers", removed.len());
        Ok(BulkDeleteReport {
            deleted: removed.into_iter().map(|s| s.id).collect(),
            storage_errors,
        })
    }
}

/// URL-friendly form of a name: the filename token with hyphens.
pub fn slugify(input: &str) -> String {
    sanitize_filename(input).replace('_', "-")
}

/// Trimmed, lowercased, de-duplicated tags in their original order.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

fn order_by_ids(mut stickers: Vec<Sticker>, ids: &[Uuid]) -> Vec<Sticker> {
    let mut ordered = Vec::with_capacity(stickers.len());
    for id in ids {
        if let Some(pos) = stickers.iter().position(|s| s.id == *id) {
            ordered.push(stickers.swap_remove(pos));
        }
    }
    ordered
}
