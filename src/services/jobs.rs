use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc, RwLock},
    time::Instant,
};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    packaging::{ArchiveOutput, BulkMode, IndividualDownload, PackagingEvent, Progress},
};

const EVENT_BUFFER: usize = 256;
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

/// What a finished job hands back.
#[derive(Debug, Clone)]
pub enum JobOutput {
    Archive(ArchiveOutput),
    Individual(Vec<IndividualDownload>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTerminal {
    Completed { file_name: Option<String>, size: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobEvent {
    Packaging(PackagingEvent),
    Terminal(JobTerminal),
}

impl JobEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Packaging(event) => event.name(),
            JobEvent::Terminal(JobTerminal::Completed { .. }) => "completed",
            JobEvent::Terminal(JobTerminal::Failed { .. }) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Terminal(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub mode: BulkMode,
    pub status: JobStatus,
    pub events: usize,
    pub error: Option<String>,
}

struct Job {
    mode: BulkMode,
    status: JobStatus,
    events: Vec<JobEvent>,
    sender: broadcast::Sender<JobEvent>,
    output: Option<JobOutput>,
    error: Option<String>,
    finished_at: Option<Instant>,
}

impl Job {
    fn push(&mut self, event: JobEvent) {
        self.events.push(event.clone());
        // No live subscribers is fine, the history still has it.
        let _ = self.sender.send(event);
    }
}

/// In-memory registry of packaging jobs. Every event is kept so late
/// subscribers get a full replay before the live tail.
pub struct JobHub {
    jobs: RwLock<HashMap<Uuid, Job>>,
    retention: Duration,
}

impl JobHub {
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Prunes finished jobs once they outlive the retention window.
    pub async fn run(&self) {
        loop {
            tokio::time::sleep(PRUNE_INTERVAL).await;
            let removed = self.prune(Instant::now()).await;
            if removed > 0 {
                tracing::debug!("Pruned {} finished packaging jobs", removed);
            }
        }
    }

    /// Register a job and drive `build` in the background. `build` gets the
    /// progress handle whose events feed the job's stream.
    pub async fn spawn<F, Fut>(self: &Arc<Self>, mode: BulkMode, build: F) -> Uuid
    where
        F: FnOnce(Progress) -> Fut,
        Fut: Future<Output = AppResult<JobOutput>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (sender, _) = broadcast::channel(EVENT_BUFFER);

        self.jobs.write().await.insert(
            id,
            Job {
                mode,
                status: JobStatus::Running,
                events: Vec::new(),
                sender,
                output: None,
                error: None,
                finished_at: None,
            },
        );
        tracing::info!("Packaging job {} started ({:?})", id, mode);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let work = build(Progress::new(tx));

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let forwarder = {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        hub.publish(id, JobEvent::Packaging(event)).await;
                    }
                })
            };

            // A panicking build still has to finish the job.
            let result = match tokio::spawn(work).await {
                Ok(result) => result,
                Err(e) => Err(AppError::Internal(anyhow::anyhow!(
                    "Packaging job {} panicked: {}",
                    id,
                    e
                ))),
            };
            // The progress sender lived inside `work`, so the forwarder drains and exits.
            if let Err(e) = forwarder.await {
                tracing::error!("Progress forwarder for job {} panicked: {}", id, e);
            }
            hub.complete(id, result).await;
        });

        id
    }

    async fn publish(&self, id: Uuid, event: JobEvent) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&id) {
            job.push(event);
        }
    }

    /// Status change and terminal event land under one lock, so a subscriber
    /// either replays the terminal event or receives it live.
    async fn complete(&self, id: Uuid, result: AppResult<JobOutput>) {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return;
        };
        job.finished_at = Some(Instant::now());

        let terminal = match result {
            Ok(output) => {
                let (file_name, size) = match &output {
                    JobOutput::Archive(archive) => {
                        (Some(archive.file_name.clone()), archive.data.len())
                    }
                    JobOutput::Individual(downloads) => (None, downloads.len()),
                };
                job.status = JobStatus::Succeeded;
                job.output = Some(output);
                JobTerminal::Completed { file_name, size }
            }
            Err(e) => {
                tracing::warn!("Packaging job {} failed: {}", id, e);
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
                JobTerminal::Failed {
                    error: e.to_string(),
                }
            }
        };

        job.push(JobEvent::Terminal(terminal));
        tracing::info!("Packaging job {} finished", id);
    }

    pub async fn summary(&self, id: Uuid) -> AppResult<JobSummary> {
        let jobs = self.jobs.read().await;
        let job = jobs.get(&id).ok_or(AppError::JobNotFound)?;

        Ok(JobSummary {
            id,
            mode: job.mode,
            status: job.status,
            events: job.events.len(),
            error: job.error.clone(),
        })
    }

    /// Replays every event so far, then follows the job until its terminal
    /// event.
    pub async fn events(&self, id: Uuid) -> AppResult<BoxStream<'static, JobEvent>> {
        let (history, live) = {
            let jobs = self.jobs.read().await;
            let job = jobs.get(&id).ok_or(AppError::JobNotFound)?;
            let live = match job.status {
                JobStatus::Running => Some(job.sender.subscribe()),
                _ => None,
            };
            (job.events.clone(), live)
        };

        let replay = stream::iter(history);
        let Some(rx) = live else {
            return Ok(replay.boxed());
        };

        let tail = stream::unfold(Some(rx), move |state| async move {
            let mut rx = state?;
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let next = if event.is_terminal() { None } else { Some(rx) };
                        return Some((event, next));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Job {} subscriber lagged, {} events skipped", id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(replay.chain(tail).boxed())
    }

    pub async fn result(&self, id: Uuid) -> AppResult<JobOutput> {
        let jobs = self.jobs.read().await;
        let job = jobs.get(&id).ok_or(AppError::JobNotFound)?;

        match (job.status, &job.output) {
            (JobStatus::Running, _) => Err(AppError::JobNotFinished),
            (JobStatus::Succeeded, Some(output)) => Ok(output.clone()),
            _ => Err(AppError::BadRequest(format!(
                "Job failed: {}",
                job.error.as_deref().unwrap_or("unknown error")
            ))),
        }
    }

    async fn prune(&self, now: Instant) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| match job.finished_at {
            Some(finished) => now.duration_since(finished) < self.retention,
            None => true,
        });
        before - jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::oneshot;

    use super::*;

    fn archive(name: &str) -> ArchiveOutput {
        ArchiveOutput {
            file_name: name.to_string(),
            data: Bytes::from_static(b"PK"),
            entries: vec!["a.png".to_string()],
            packaged_ids: vec![Uuid::new_v4()],
            failures: Vec::new(),
        }
    }

    #[tokio::test]
    async fn live_subscriber_sees_progress_then_completion() {
        let hub = Arc::new(JobHub::new(Duration::from_secs(60)));
        let (go_tx, go_rx) = oneshot::channel::<()>();

        let id = hub
            .spawn(BulkMode::Archive, |progress| async move {
                let _ = go_rx.await;
                progress.emit(PackagingEvent::Started {
                    mode: BulkMode::Archive,
                    total: 1,
                });
                progress.emit(PackagingEvent::Finished {
                    succeeded: 1,
                    failed: 0,
                });
                Ok(JobOutput::Archive(archive("stickers.zip")))
            })
            .await;

        let stream = hub.events(id).await.unwrap();
        go_tx.send(()).unwrap();
        let events: Vec<JobEvent> = stream.collect().await;

        assert_eq!(
            events.iter().map(JobEvent::name).collect::<Vec<_>>(),
            vec!["started", "finished", "completed"]
        );
        assert!(matches!(
            hub.result(id).await.unwrap(),
            JobOutput::Archive(output) if output.file_name == "stickers.zip"
        ));
    }

    #[tokio::test]
    async fn finished_jobs_replay_history() {
        let hub = Arc::new(JobHub::new(Duration::from_secs(60)));
        let id = hub
            .spawn(BulkMode::Individual, |_| async {
                Err(AppError::Validation("No stickers selected".to_string()))
            })
            .await;

        // Wait for the job by following it once.
        let _: Vec<JobEvent> = hub.events(id).await.unwrap().collect().await;

        let replay: Vec<JobEvent> = hub.events(id).await.unwrap().collect().await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].name(), "failed");

        let summary = hub.summary(id).await.unwrap();
        assert_eq!(summary.status, JobStatus::Failed);
        assert!(matches!(hub.result(id).await, Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn panicking_build_fails_the_job() {
        let hub = Arc::new(JobHub::new(Duration::from_secs(60)));
        let id = hub
            .spawn(BulkMode::Archive, |progress| async move {
                progress.emit(PackagingEvent::Started {
                    mode: BulkMode::Archive,
                    total: 2,
                });
                let encoded: Option<Vec<u8>> = None;
                let _ = encoded.expect("encoder crashed");
                Ok(JobOutput::Individual(Vec::new()))
            })
            .await;

        let events: Vec<JobEvent> = hub.events(id).await.unwrap().collect().await;
        assert_eq!(events.last().map(JobEvent::name), Some("failed"));

        let summary = hub.summary(id).await.unwrap();
        assert_eq!(summary.status, JobStatus::Failed);
        assert!(matches!(hub.result(id).await, Err(AppError::BadRequest(_))));
        assert_eq!(
            hub.prune(Instant::now() + Duration::from_secs(61)).await,
            1
        );
    }

    #[tokio::test]
    async fn running_job_result_is_not_ready() {
        let hub = Arc::new(JobHub::new(Duration::from_secs(60)));
        let (_hold, wait) = oneshot::channel::<()>();
        let id = hub
            .spawn(BulkMode::Archive, |_| async move {
                let _ = wait.await;
                Ok(JobOutput::Individual(Vec::new()))
            })
            .await;

        assert!(matches!(hub.result(id).await, Err(AppError::JobNotFinished)));
        assert!(matches!(
            hub.result(Uuid::new_v4()).await,
            Err(AppError::JobNotFound)
        ));
    }

    #[tokio::test]
    async fn prune_drops_only_expired_finished_jobs() {
        let hub = Arc::new(JobHub::new(Duration::from_secs(60)));
        let (_hold, wait) = oneshot::channel::<()>();
        let running = hub
            .spawn(BulkMode::Archive, |_| async move {
                let _ = wait.await;
                Ok(JobOutput::Individual(Vec::new()))
            })
            .await;
        let done = hub
            .spawn(BulkMode::Individual, |_| async {
                Ok(JobOutput::Individual(Vec::new()))
            })
            .await;
        let _: Vec<JobEvent> = hub.events(done).await.unwrap().collect().await;

        assert_eq!(hub.prune(Instant::now()).await, 0);
        assert_eq!(
            hub.prune(Instant::now() + Duration::from_secs(61)).await,
            1
        );
        assert!(hub.summary(running).await.is_ok());
        assert!(matches!(hub.summary(done).await, Err(AppError::JobNotFound)));
    }
}
