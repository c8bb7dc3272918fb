use std::sync::Arc;

use uuid::Uuid;

use crate::{
    config::PackagingConfig,
    error::AppResult,
    packaging::{
        build_archive, build_messaging_pack, run_individual, BulkItem, BulkMode, PackOptions,
        Progress,
    },
    services::{
        downloads::{DownloadTracker, Requester, TrackOutcome},
        jobs::JobOutput,
    },
    storage::fetch::ImageFetcher,
};

const DEFAULT_PACK_TITLE: &str = "Stickers";

/// Runs one packaging mode and records a download for every sticker that
/// made it into the result.
#[derive(Clone)]
pub struct BulkService {
    fetcher: Arc<dyn ImageFetcher>,
    tracker: Arc<DownloadTracker>,
    config: PackagingConfig,
}

impl BulkService {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        tracker: Arc<DownloadTracker>,
        config: &PackagingConfig,
    ) -> Self {
        Self {
            fetcher,
            tracker,
            config: config.clone(),
        }
    }

    pub async fn package(
        &self,
        mode: BulkMode,
        title: Option<&str>,
        items: &[BulkItem],
        requester: &Requester,
        progress: &Progress,
    ) -> AppResult<JobOutput> {
        let (output, packaged) = match mode {
            BulkMode::Archive => {
                let archive = build_archive(items, title, &*self.fetcher, progress).await?;
                let ids = archive.packaged_ids.clone();
                (JobOutput::Archive(archive), ids)
            }
            BulkMode::MessagingPack => {
                let pack = build_messaging_pack(
                    title.unwrap_or(DEFAULT_PACK_TITLE),
                    items,
                    &*self.fetcher,
                    PackOptions::from(&self.config),
                    progress,
                )
                .await?;
                let ids = pack.packaged_ids.clone();
                (JobOutput::Archive(pack), ids)
            }
            BulkMode::Individual => {
                let downloads =
                    run_individual(items, self.config.individual_delay, progress).await?;
                let ids = downloads.iter().map(|d| d.id).collect();
                (JobOutput::Individual(downloads), ids)
            }
        };

        self.record_downloads(packaged, requester.clone());
        Ok(output)
    }

    /// Counting waits out the tracker's settle delay, so it runs detached
    /// from the response.
    pub fn record_downloads(&self, ids: Vec<Uuid>, requester: Requester) {
        if ids.is_empty() {
            return;
        }

        let tracker = Arc::clone(&self.tracker);
        tokio::spawn(async move {
            match tracker
                .track_many(&ids, &requester.ip, requester.user_agent.as_deref())
                .await
            {
                Ok(outcomes) => {
                    let failed = outcomes
                        .iter()
                        .filter(|o| matches!(o.outcome, TrackOutcome::Failed { .. }))
                        .count();
                    if failed > 0 {
                        tracing::warn!("{} of {} download counts not updated", failed, ids.len());
                    }
                }
                Err(e) => tracing::warn!("Failed to record {} downloads: {}", ids.len(), e),
            }
        });
    }
}
