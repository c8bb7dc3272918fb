use std::io::{Cursor, Write};

use bytes::Bytes;
use futures::future::join_all;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use super::{
    sanitize_filename, ArchiveOutput, BulkItem, BulkMode, EntryNames, PackagingEvent, Progress,
};
use crate::{
    config::PackagingConfig,
    error::{AppError, AppResult},
    imaging::{decode, encode_webp, letterbox},
    storage::fetch::ImageFetcher,
};

pub const README_NAME: &str = "README.txt";

#[derive(Debug, Clone, Copy)]
pub struct PackOptions {
    pub max_stickers: usize,
    pub image_size: u32,
    pub quality: f32,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            max_stickers: 30,
            image_size: 512,
            quality: 80.0,
        }
    }
}

impl From<&PackagingConfig> for PackOptions {
    fn from(config: &PackagingConfig) -> Self {
        Self {
            max_stickers: config.pack_max_stickers,
            image_size: config.pack_image_size,
            quality: config.pack_webp_quality,
        }
    }
}

/// Checks a selection against the pack size limits before any work is done.
pub fn validate_selection(count: usize, options: &PackOptions) -> AppResult<()> {
    if count == 0 {
        return Err(AppError::Validation("No stickers selected".to_string()));
    }
    if count > options.max_stickers {
        return Err(AppError::Validation(format!(
            "A sticker pack holds at most {} stickers, {} selected",
            options.max_stickers, count
        )));
    }
    Ok(())
}

/// Builds a messaging-app sticker pack: every image letterboxed into a
/// transparent square, encoded as lossy WebP, plus import instructions.
/// A pack is all or nothing, so any failed item fails the whole build.
pub async fn build_messaging_pack(
    title: &str,
    items: &[BulkItem],
    fetcher: &dyn ImageFetcher,
    options: PackOptions,
    progress: &Progress,
) -> AppResult<ArchiveOutput> {
    validate_selection(items.len(), &options)?;

    let total = items.len();
    progress.emit(PackagingEvent::Started {
        mode: BulkMode::MessagingPack,
        total,
    });

    let fetched = join_all(items.iter().map(|item| fetcher.fetch(&item.image_url))).await;

    let mut names = EntryNames::default();
    let mut entries = Vec::with_capacity(total + 1);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let stored = FileOptions::default().compression_method(CompressionMethod::Stored);

    for (index, (item, result)) in items.iter().zip(fetched).enumerate() {
        let encoded = match result {
            Ok(data) => convert(data, options).await,
            Err(e) => Err(e),
        };
        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("Sticker pack item {} failed: {}", item.id, e);
                progress.emit(PackagingEvent::ItemFailed {
                    index,
                    total,
                    id: item.id,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let stem = format!("{:02}_{}", index + 1, sanitize_filename(&item.name));
        let file_name = names.claim(&stem, "webp");
        writer.start_file(file_name.clone(), stored)?;
        writer.write_all(&encoded)?;

        progress.emit(PackagingEvent::ItemDone {
            index,
            total,
            id: item.id,
            file_name: file_name.clone(),
            url: None,
        });
        entries.push(file_name);
    }

    let readme = FileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file(README_NAME, readme)?;
    writer.write_all(instructions(title, total, &options).as_bytes())?;
    entries.push(README_NAME.to_string());

    let data = writer.finish()?.into_inner();

    progress.emit(PackagingEvent::Finished {
        succeeded: total,
        failed: 0,
    });

    Ok(ArchiveOutput {
        file_name: format!("{}_sticker_pack.zip", sanitize_filename(title)),
        data: Bytes::from(data),
        entries,
        packaged_ids: items.iter().map(|item| item.id).collect(),
        failures: Vec::new(),
    })
}

async fn convert(data: Bytes, options: PackOptions) -> AppResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> AppResult<Vec<u8>> {
        let image = decode(&data)?;
        let square = letterbox(&image, options.image_size);
        Ok(encode_webp(&square, options.quality))
    })
    .await
    .map_err(|e| anyhow::anyhow!("Sticker conversion task failed: {}", e))?
}

fn instructions(title: &str, count: usize, options: &PackOptions) -> String {
    format!(
        "{title}\n\
         {underline}\n\n\
         This archive contains {count} stickers prepared for WhatsApp.\n\
         Every image is a {size}x{size} WebP with a transparent background.\n\n\
         How to add them:\n\
         1. Unzip this archive on your phone.\n\
         2. Install a sticker maker app that imports WebP stickers\n   \
            (for example \"Sticker Maker\" or \"Personal Stickers\").\n\
         3. Create a new pack, import the {count} images in order and pick one\n   \
            as the tray icon.\n\
         4. Tap \"Add to WhatsApp\".\n\n\
         This archive holds up to {max} stickers. WhatsApp only publishes packs\n         with at least 3, so add more in the sticker maker app if needed.\n",
        title = title,
        underline = "=".repeat(title.chars().count().max(1)),
        count = count,
        size = options.image_size,
        max = options.max_stickers,
    )
}
