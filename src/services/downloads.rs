use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    config::TrackerConfig,
    error::{AppError, AppResult},
    models::{DownloadRecord, NewDownloadRecord},
};

/// SQLSTATE raised when a row-level policy or grant blocks a statement.
const INSUFFICIENT_PRIVILEGE: &str = "42501";

/// Persistence used by the tracker: the append-only audit table plus the
/// denormalized counter on the sticker row.
#[async_trait]
pub trait DownloadStore: Send + Sync {
    async fn insert_records(&self, records: &[NewDownloadRecord]) -> AppResult<()>;

    /// Fails with [`AppError::AccessDenied`] when the audit table is not
    /// readable by this connection.
    async fn count_records(&self, sticker_id: Uuid) -> AppResult<i64>;

    async fn current_count(&self, sticker_id: Uuid) -> AppResult<i64>;

    async fn set_count(&self, sticker_id: Uuid, count: i64) -> AppResult<()>;
}

pub struct PgDownloadStore {
    db: PgPool,
}

impl PgDownloadStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

impl PgDownloadStore {
    /// Newest audit rows for one sticker (admin)
    pub async fn recent(&self, sticker_id: Uuid, limit: i64) -> AppResult<Vec<DownloadRecord>> {
        let records: Vec<DownloadRecord> = sqlx::query_as(
            r#"
            SELECT * FROM download_records
            WHERE sticker_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(sticker_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await
        .map_err(map_policy_error)?;

        Ok(records)
    }
}

fn map_policy_error(e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.code().as_deref() == Some(INSUFFICIENT_PRIVILEGE) {
            return AppError::AccessDenied;
        }
    }
    AppError::Database(e)
}

#[async_trait]
impl DownloadStore for PgDownloadStore {
    async fn insert_records(&self, records: &[NewDownloadRecord]) -> AppResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO download_records (id, sticker_id, ip_hash, user_agent) ");
        builder.push_values(records, |mut row, record| {
            row.push_bind(Uuid::new_v4())
                .push_bind(record.sticker_id)
                .push_bind(record.ip_hash.clone())
                .push_bind(record.user_agent.clone());
        });

        builder
            .build()
            .execute(&self.db)
            .await
            .map_err(map_policy_error)?;

        Ok(())
    }

    async fn count_records(&self, sticker_id: Uuid) -> AppResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM download_records WHERE sticker_id = $1")
                .bind(sticker_id)
                .fetch_one(&self.db)
                .await
                .map_err(map_policy_error)?;

        Ok(count)
    }

    async fn current_count(&self, sticker_id: Uuid) -> AppResult<i64> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT download_count FROM stickers WHERE id = $1")
                .bind(sticker_id)
                .fetch_optional(&self.db)
                .await?;

        count.ok_or(AppError::StickerNotFound)
    }

    async fn set_count(&self, sticker_id: Uuid, count: i64) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE stickers SET download_count = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(count)
        .bind(sticker_id)
        .execute(&self.db)
        .await
        .map_err(map_policy_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::StickerNotFound);
        }

        Ok(())
    }
}

/// Who asked for a download, as seen by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct Requester {
    pub ip: String,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrackOutcome {
    Counted { download_count: i64 },
    /// Another request for the same sticker is still in flight.
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub sticker_id: Uuid,
    #[serde(flatten)]
    pub outcome: TrackOutcome,
}

/// Records download events and keeps `stickers.download_count` in step with
/// the audit table.
///
/// The in-flight set only protects against double counting inside this
/// process; separate server instances can still race each other.
pub struct DownloadTracker {
    store: Arc<dyn DownloadStore>,
    pending: Mutex<HashSet<Uuid>>,
    settle_delay: Duration,
    ip_hash_salt: String,
}

/// Releases in-flight markers on every exit path.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<Uuid>>,
    ids: Vec<Uuid>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for id in &self.ids {
            pending.remove(id);
        }
    }
}

impl DownloadTracker {
    pub fn new(store: Arc<dyn DownloadStore>, config: &TrackerConfig) -> Self {
        Self {
            store,
            pending: Mutex::new(HashSet::new()),
            settle_delay: config.settle_delay,
            ip_hash_salt: config.ip_hash_salt.clone(),
        }
    }

    /// Marks every id not already in flight; the returned guard owns exactly
    /// those ids.
    fn claim(&self, ids: &[Uuid]) -> PendingGuard<'_> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let claimed = ids.iter().copied().filter(|id| pending.insert(*id)).collect();
        PendingGuard {
            pending: &self.pending,
            ids: claimed,
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self, sticker_id: Uuid) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&sticker_id)
    }

    /// Records one download of `sticker_id` and returns the refreshed count.
    pub async fn track(
        &self,
        sticker_id: Uuid,
        client_ip: &str,
        user_agent: Option<&str>,
    ) -> AppResult<TrackOutcome> {
        let guard = self.claim(&[sticker_id]);
        if guard.ids.is_empty() {
            tracing::debug!("Download of {} already in flight, skipping", sticker_id);
            return Ok(TrackOutcome::Skipped);
        }

        let record = NewDownloadRecord {
            sticker_id,
            ip_hash: hash_ip(&self.ip_hash_salt, client_ip),
            user_agent: user_agent.map(str::to_string),
        };

        self.store
            .insert_records(std::slice::from_ref(&record))
            .await
            .inspect_err(|e| tracing::error!("Failed to record download of {}: {}", sticker_id, e))?;

        let download_count = self.refresh_count(sticker_id).await?;
        drop(guard);

        Ok(TrackOutcome::Counted { download_count })
    }

    /// Batch form of [`track`](Self::track): one insert for all ids, then the
    /// per-id count refresh runs concurrently and failures stay per id.
    pub async fn track_many(
        &self,
        sticker_ids: &[Uuid],
        client_ip: &str,
        user_agent: Option<&str>,
    ) -> AppResult<Vec<BatchOutcome>> {
        let mut seen = HashSet::new();
        let unique: Vec<Uuid> = sticker_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        let guard = self.claim(&unique);
        let claimed: HashSet<Uuid> = guard.ids.iter().copied().collect();

        let ip_hash = hash_ip(&self.ip_hash_salt, client_ip);
        let records: Vec<NewDownloadRecord> = guard
            .ids
            .iter()
            .map(|&sticker_id| NewDownloadRecord {
                sticker_id,
                ip_hash: ip_hash.clone(),
                user_agent: user_agent.map(str::to_string),
            })
            .collect();

        self.store
            .insert_records(&records)
            .await
            .inspect_err(|e| tracing::error!("Failed to record {} downloads: {}", records.len(), e))?;

        let refreshed = join_all(guard.ids.iter().map(|&id| async move {
            let outcome = match self.refresh_count(id).await {
                Ok(download_count) => TrackOutcome::Counted { download_count },
                Err(e) => TrackOutcome::Failed {
                    error: e.to_string(),
                },
            };
            (id, outcome)
        }))
        .await;
        drop(guard);

        let outcomes = unique
            .into_iter()
            .map(|sticker_id| {
                let outcome = if claimed.contains(&sticker_id) {
                    refreshed
                        .iter()
                        .find(|(id, _)| *id == sticker_id)
                        .map(|(_, outcome)| outcome.clone())
                        .unwrap_or(TrackOutcome::Skipped)
                } else {
                    TrackOutcome::Skipped
                };
                BatchOutcome {
                    sticker_id,
                    outcome,
                }
            })
            .collect();

        Ok(outcomes)
    }

    /// Waits for the audit insert to settle, re-derives the count from the
    /// audit table and writes it back. When the audit table is unreadable the
    /// previous counter is incremented instead.
    async fn refresh_count(&self, sticker_id: Uuid) -> AppResult<i64> {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        let count = match self.store.count_records(sticker_id).await {
            Ok(count) => count,
            Err(AppError::AccessDenied) => {
                tracing::warn!(
                    "Audit table not readable, incrementing counter of {} instead",
                    sticker_id
                );
                self.store
                    .current_count(sticker_id)
                    .await
                    .inspect_err(|e| {
                        tracing::error!("Failed to read counter of {}: {}", sticker_id, e)
                    })?
                    + 1
            }
            Err(e) => {
                tracing::error!("Failed to count downloads of {}: {}", sticker_id, e);
                return Err(e);
            }
        };

        self.store
            .set_count(sticker_id, count)
            .await
            .inspect_err(|e| tracing::error!("Failed to update counter of {}: {}", sticker_id, e))?;

        Ok(count)
    }
}

/// Hex SHA-256 of the salted client address; raw addresses are never stored.
pub fn hash_ip(salt: &str, client_ip: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(client_ip.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<Vec<NewDownloadRecord>>,
        counters: Mutex<HashMap<Uuid, i64>>,
        insert_calls: AtomicUsize,
        deny_audit_reads: AtomicBool,
        fail_inserts: AtomicBool,
        broken_counters: Mutex<HashSet<Uuid>>,
    }

    #[async_trait]
    impl DownloadStore for MemoryStore {
        async fn insert_records(&self, records: &[NewDownloadRecord]) -> AppResult<()> {
            self.insert_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_inserts.load(Ordering::SeqCst) {
                return Err(AppError::Internal(anyhow::anyhow!("insert failed")));
            }
            self.records.lock().unwrap().extend_from_slice(records);
            Ok(())
        }

        async fn count_records(&self, sticker_id: Uuid) -> AppResult<i64> {
            if self.deny_audit_reads.load(Ordering::SeqCst) {
                return Err(AppError::AccessDenied);
            }
            let records = self.records.lock().unwrap();
            Ok(records.iter().filter(|r| r.sticker_id == sticker_id).count() as i64)
        }

        async fn current_count(&self, sticker_id: Uuid) -> AppResult<i64> {
            Ok(*self.counters.lock().unwrap().get(&sticker_id).unwrap_or(&0))
        }

        async fn set_count(&self, sticker_id: Uuid, count: i64) -> AppResult<()> {
            if self.broken_counters.lock().unwrap().contains(&sticker_id) {
                return Err(AppError::StickerNotFound);
            }
            self.counters.lock().unwrap().insert(sticker_id, count);
            Ok(())
        }
    }

    fn tracker(store: Arc<MemoryStore>) -> DownloadTracker {
        DownloadTracker::new(
            store,
            &TrackerConfig {
                settle_delay: Duration::from_millis(500),
                ip_hash_salt: "pepper".to_string(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_duplicate_is_skipped() {
        let store = Arc::new(MemoryStore::default());
        let tracker = tracker(store.clone());
        let id = Uuid::new_v4();

        let (first, second) = tokio::join!(
            tracker.track(id, "10.0.0.1", Some("agent")),
            tracker.track(id, "10.0.0.1", Some("agent")),
        );

        assert_eq!(first.unwrap(), TrackOutcome::Counted { download_count: 1 });
        assert_eq!(second.unwrap(), TrackOutcome::Skipped);
        assert_eq!(store.records.lock().unwrap().len(), 1);
        assert!(!tracker.is_pending(id));

        let third = tracker.track(id, "10.0.0.2", None).await.unwrap();
        assert_eq!(third, TrackOutcome::Counted { download_count: 2 });
        assert_eq!(store.counters.lock().unwrap()[&id], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn different_ids_are_tracked_independently() {
        let store = Arc::new(MemoryStore::default());
        let tracker = tracker(store.clone());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let (first, second) = tokio::join!(
            tracker.track(a, "10.0.0.1", None),
            tracker.track(b, "10.0.0.1", None),
        );

        assert_eq!(first.unwrap(), TrackOutcome::Counted { download_count: 1 });
        assert_eq!(second.unwrap(), TrackOutcome::Counted { download_count: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn denied_audit_read_falls_back_to_increment() {
        let store = Arc::new(MemoryStore::default());
        store.deny_audit_reads.store(true, Ordering::SeqCst);
        let id = Uuid::new_v4();
        store.counters.lock().unwrap().insert(id, 41);
        let tracker = tracker(store.clone());

        let outcome = tracker.track(id, "10.0.0.1", None).await.unwrap();

        assert_eq!(outcome, TrackOutcome::Counted { download_count: 42 });
        assert_eq!(store.counters.lock().unwrap()[&id], 42);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_propagates_and_clears_pending_marker() {
        let store = Arc::new(MemoryStore::default());
        store.fail_inserts.store(true, Ordering::SeqCst);
        let tracker = tracker(store.clone());
        let id = Uuid::new_v4();

        tokio_test::assert_err!(tracker.track(id, "10.0.0.1", None).await);
        assert!(!tracker.is_pending(id));

        store.fail_inserts.store(false, Ordering::SeqCst);
        let outcome = tokio_test::assert_ok!(tracker.track(id, "10.0.0.1", None).await);
        assert_eq!(outcome, TrackOutcome::Counted { download_count: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn batch_isolates_failures_and_inserts_once() {
        let store = Arc::new(MemoryStore::default());
        let tracker = tracker(store.clone());
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.broken_counters.lock().unwrap().insert(c);

        let outcomes = tracker
            .track_many(&[a, b, a, c], "10.0.0.1", Some("agent"))
            .await
            .unwrap();

        assert_eq!(store.insert_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.records.lock().unwrap().len(), 3);
        assert_eq!(
            outcomes.iter().map(|o| o.sticker_id).collect::<Vec<_>>(),
            vec![a, b, c]
        );
        assert_eq!(outcomes[0].outcome, TrackOutcome::Counted { download_count: 1 });
        assert_eq!(outcomes[1].outcome, TrackOutcome::Counted { download_count: 1 });
        assert!(matches!(outcomes[2].outcome, TrackOutcome::Failed { .. }));
        assert!(!tracker.is_pending(c));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_skips_ids_already_in_flight() {
        let store = Arc::new(MemoryStore::default());
        let tracker = tracker(store.clone());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let ids = [a, b];

        let (single, batch) = tokio::join!(
            tracker.track(a, "10.0.0.1", None),
            tracker.track_many(&ids, "10.0.0.1", None),
        );

        assert_eq!(single.unwrap(), TrackOutcome::Counted { download_count: 1 });
        let batch = batch.unwrap();
        assert_eq!(batch[0].outcome, TrackOutcome::Skipped);
        assert_eq!(batch[1].outcome, TrackOutcome::Counted { download_count: 1 });
        assert_eq!(store.records.lock().unwrap().len(), 2);
    }

    #[test]
    fn ip_hash_is_salted_and_opaque() {
        let hashed = hash_ip("pepper", "203.0.113.7");
        assert_eq!(hashed.len(), 64);
        assert_eq!(hashed, hash_ip("pepper", "203.0.113.7"));
        assert_ne!(hashed, hash_ip("salt", "203.0.113.7"));
        assert!(hashed.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = BatchOutcome {
            sticker_id: Uuid::nil(),
            outcome: TrackOutcome::Counted { download_count: 3 },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "counted");
        assert_eq!(json["download_count"], 3);
    }
}
