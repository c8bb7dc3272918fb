use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use super::{
    extension_from_url, sanitize_filename, BulkItem, BulkMode, EntryNames, PackagingEvent,
    Progress,
};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndividualDownload {
    pub id: Uuid,
    pub file_name: String,
    pub url: String,
}

/// Hands items out one at a time, pausing `delay` between them so clients
/// do not trip browser download throttling. A progress event follows every
/// item.
pub async fn run_individual(
    items: &[BulkItem],
    delay: Duration,
    progress: &Progress,
) -> AppResult<Vec<IndividualDownload>> {
    if items.is_empty() {
        return Err(AppError::Validation("No stickers selected".to_string()));
    }

    let total = items.len();
    progress.emit(PackagingEvent::Started {
        mode: BulkMode::Individual,
        total,
    });

    let mut names = EntryNames::default();
    let mut downloads = Vec::with_capacity(total);

    for (index, item) in items.iter().enumerate() {
        if index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let extension = extension_from_url(&item.image_url).unwrap_or_else(|| "png".to_string());
        let file_name = names.claim(&sanitize_filename(&item.name), &extension);

        progress.emit(PackagingEvent::ItemDone {
            index,
            total,
            id: item.id,
            file_name: file_name.clone(),
            url: Some(item.image_url.clone()),
        });
        downloads.push(IndividualDownload {
            id: item.id,
            file_name,
            url: item.image_url.clone(),
        });
    }

    progress.emit(PackagingEvent::Finished {
        succeeded: downloads.len(),
        failed: 0,
    });

    Ok(downloads)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn items() -> Vec<BulkItem> {
        ["Happy Frog", "Sad Frog", "Happy Frog"]
            .iter()
            .enumerate()
            .map(|(i, name)| BulkItem {
                id: Uuid::new_v4(),
                name: name.to_string(),
                image_url: format!("https://cdn.test/webp/{}.webp", i),
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn paces_items_and_reports_each_one() {
        let items = items();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = tokio::time::Instant::now();

        let downloads = run_individual(&items, Duration::from_millis(300), &Progress::new(tx))
            .await
            .unwrap();

        // Two pauses between three items.
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert_eq!(
            downloads
                .iter()
                .map(|d| d.file_name.as_str())
                .collect::<Vec<_>>(),
            vec!["happy_frog.webp", "sad_frog.webp", "happy_frog_2.webp"]
        );

        let mut done = 0;
        while let Ok(event) = rx.try_recv() {
            if let PackagingEvent::ItemDone { url, .. } = event {
                assert!(url.is_some());
                done += 1;
            }
        }
        assert_eq!(done, 3);
    }

    #[tokio::test]
    async fn empty_selection_is_rejected() {
        let result = run_individual(&[], Duration::ZERO, &Progress::none()).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
