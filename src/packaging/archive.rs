use std::io::{Cursor, Write};

use bytes::Bytes;
use futures::future::join_all;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use super::{
    extension_from_url, sanitize_filename, timestamped_name, ArchiveOutput, BulkItem, BulkMode,
    EntryNames, PackagingEvent, Progress,
};
use crate::{
    error::{AppError, AppResult},
    imaging::sniff_extension,
    storage::fetch::ImageFetcher,
};

const KNOWN_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "webp", "bmp"];

/// Fetches every item concurrently and zips whatever arrived. Failed items
/// are listed in [`ArchiveOutput::failures`]; the call only fails when no
/// item could be fetched at all.
pub async fn build_archive(
    items: &[BulkItem],
    archive_name: Option<&str>,
    fetcher: &dyn ImageFetcher,
    progress: &Progress,
) -> AppResult<ArchiveOutput> {
    if items.is_empty() {
        return Err(AppError::Validation("No stickers selected".to_string()));
    }

    let total = items.len();
    progress.emit(PackagingEvent::Started {
        mode: BulkMode::Archive,
        total,
    });

    let fetched = join_all(items.iter().enumerate().map(|(index, item)| async move {
        let result = fetcher.fetch(&item.image_url).await;
        if let Err(e) = &result {
            progress.emit(PackagingEvent::ItemFailed {
                index,
                total,
                id: item.id,
                error: e.to_string(),
            });
        }
        (index, item, result)
    }))
    .await;

    let mut names = EntryNames::default();
    let mut entries = Vec::new();
    let mut packaged_ids = Vec::new();
    let mut failures = Vec::new();
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);

    for (index, item, result) in fetched {
        let data: Bytes = match result {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Skipping {} in archive: {}", item.id, e);
                failures.push(format!("{}: {}", item.name, e));
                continue;
            }
        };

        let extension = entry_extension(&item.image_url, &data);
        let file_name = names.claim(&sanitize_filename(&item.name), &extension);
        writer.start_file(file_name.clone(), options)?;
        writer.write_all(&data)?;

        progress.emit(PackagingEvent::ItemDone {
            index,
            total,
            id: item.id,
            file_name: file_name.clone(),
            url: None,
        });
        entries.push(file_name);
        packaged_ids.push(item.id);
    }

    if entries.is_empty() {
        return Err(AppError::Fetch(format!(
            "All {} downloads failed: {}",
            total,
            failures.join("; ")
        )));
    }

    let data = writer.finish()?.into_inner();

    progress.emit(PackagingEvent::Finished {
        succeeded: entries.len(),
        failed: failures.len(),
    });

    let file_name = match archive_name {
        Some(name) => format!("{}.zip", sanitize_filename(name)),
        None => timestamped_name("stickers"),
    };

    Ok(ArchiveOutput {
        file_name,
        data: Bytes::from(data),
        entries,
        packaged_ids,
        failures,
    })
}

fn entry_extension(url: &str, data: &[u8]) -> String {
    extension_from_url(url)
        .filter(|ext| KNOWN_EXTENSIONS.contains(&ext.as_str()))
        .or_else(|| sniff_extension(data).map(str::to_string))
        .unwrap_or_else(|| "png".to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use image::Rgba;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::imaging::test_support::png_bytes;
    use crate::storage::fetch::test_support::StaticFetcher;

    fn item(name: &str, url: &str) -> BulkItem {
        BulkItem {
            id: Uuid::new_v4(),
            name: name.to_string(),
            image_url: url.to_string(),
        }
    }

    fn entry_names(data: &[u8]) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(data)).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn partial_failure_still_produces_archive() {
        let fetcher = StaticFetcher::default()
            .with("https://cdn.test/a.png", png_bytes(4, 4, Rgba([1, 1, 1, 255])))
            .with("https://cdn.test/c.webp", b"RIFFxxxxWEBP".to_vec());
        let items = vec![
            item("Kermit Sad!! (v2)", "https://cdn.test/a.png"),
            item("Missing", "https://cdn.test/b.png"),
            item("Happy", "https://cdn.test/c.webp"),
        ];

        let output = build_archive(&items, None, &fetcher, &Progress::none())
            .await
            .unwrap();

        assert_eq!(output.entries, vec!["kermit_sad_v2.png", "happy.webp"]);
        assert_eq!(entry_names(&output.data), output.entries);
        assert_eq!(output.packaged_ids, vec![items[0].id, items[2].id]);
        assert_eq!(output.failures.len(), 1);
        assert!(output.failures[0].starts_with("Missing:"));
        assert!(output.file_name.starts_with("stickers_"));
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn archive_preserves_bytes_and_dedupes_names() {
        let png = png_bytes(3, 3, Rgba([9, 9, 9, 255]));
        let fetcher = StaticFetcher::default()
            .with("https://cdn.test/one", png.clone())
            .with("https://cdn.test/two", png.clone());
        let items = vec![
            item("Same Name", "https://cdn.test/one"),
            item("same-name", "https://cdn.test/two"),
        ];

        let output = build_archive(&items, Some("Muppet Pack"), &fetcher, &Progress::none())
            .await
            .unwrap();

        assert_eq!(output.file_name, "muppet_pack.zip");
        assert_eq!(output.entries, vec!["same_name.png", "same_name_2.png"]);

        let mut archive = zip::ZipArchive::new(Cursor::new(output.data.as_ref())).unwrap();
        let mut stored = Vec::new();
        archive
            .by_name("same_name_2.png")
            .unwrap()
            .read_to_end(&mut stored)
            .unwrap();
        assert_eq!(stored, png);
    }

    #[tokio::test]
    async fn all_failures_is_an_error() {
        let fetcher = StaticFetcher::default();
        let items = vec![item("a", "https://cdn.test/a.png")];

        let result = build_archive(&items, None, &fetcher, &Progress::none()).await;
        assert!(matches!(result, Err(AppError::Fetch(_))));
    }

    #[tokio::test]
    async fn empty_selection_is_rejected() {
        let fetcher = StaticFetcher::default();
        let result = build_archive(&[], None, &fetcher, &Progress::none()).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn emits_progress_for_every_item() {
        let fetcher = StaticFetcher::default()
            .with("https://cdn.test/a.png", png_bytes(2, 2, Rgba([0, 0, 0, 255])));
        let items = vec![
            item("a", "https://cdn.test/a.png"),
            item("b", "https://cdn.test/b.png"),
        ];
        let (tx, mut rx) = mpsc::unbounded_channel();

        build_archive(&items, None, &fetcher, &Progress::new(tx))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert!(matches!(events.first(), Some(PackagingEvent::Started { total: 2, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, PackagingEvent::ItemFailed { index: 1, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, PackagingEvent::ItemDone { index: 0, .. })));
        assert_eq!(
            events.last(),
            Some(&PackagingEvent::Finished {
                succeeded: 1,
                failed: 1
            })
        );
    }
}
