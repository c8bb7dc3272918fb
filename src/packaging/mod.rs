//! Bulk packaging of stickers into downloadable artifacts.
//!
//! Long-running operations report progress through a [`Progress`] handle
//! instead of return values, so callers decide how to surface it (SSE,
//! logs, or nothing at all).

pub mod archive;
pub mod individual;
pub mod messaging_pack;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub use archive::build_archive;
pub use individual::{run_individual, IndividualDownload};
pub use messaging_pack::{build_messaging_pack, PackOptions};

use crate::models::Sticker;

const MAX_FILENAME_LEN: usize = 50;
const FALLBACK_FILENAME: &str = "sticker";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItem {
    pub id: Uuid,
    pub name: String,
    pub image_url: String,
}

impl From<&Sticker> for BulkItem {
    fn from(sticker: &Sticker) -> Self {
        Self {
            id: sticker.id,
            name: sticker.name.clone(),
            image_url: sticker.image_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkMode {
    Archive,
    MessagingPack,
    Individual,
}

impl Default for BulkMode {
    fn default() -> Self {
        Self::Archive
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PackagingEvent {
    Started {
        mode: BulkMode,
        total: usize,
    },
    ItemDone {
        index: usize,
        total: usize,
        id: Uuid,
        file_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    ItemFailed {
        index: usize,
        total: usize,
        id: Uuid,
        error: String,
    },
    Finished {
        succeeded: usize,
        failed: usize,
    },
}

impl PackagingEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            PackagingEvent::Started { .. } => "started",
            PackagingEvent::ItemDone { .. } => "item_done",
            PackagingEvent::ItemFailed { .. } => "item_failed",
            PackagingEvent::Finished { .. } => "finished",
        }
    }
}

/// Sending half of a progress channel. A handle without a channel drops
/// every event.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    tx: Option<mpsc::UnboundedSender<PackagingEvent>>,
}

impl Progress {
    pub fn new(tx: mpsc::UnboundedSender<PackagingEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: PackagingEvent) {
        if let Some(tx) = &self.tx {
            // A receiver that went away only means nobody is watching.
            let _ = tx.send(event);
        }
    }
}

/// A finished zip archive held in memory.
#[derive(Debug, Clone)]
pub struct ArchiveOutput {
    pub file_name: String,
    pub data: bytes::Bytes,
    pub entries: Vec<String>,
    pub packaged_ids: Vec<Uuid>,
    pub failures: Vec<String>,
}

/// Turns a display name into a filesystem-safe token: lowercase ASCII
/// alphanumerics separated by single underscores, at most 50 characters.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_separator = false;

    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(ch.to_ascii_lowercase());
        } else if ch.is_whitespace() || ch == '_' || ch == '-' {
            pending_separator = true;
        }
    }

    out.truncate(MAX_FILENAME_LEN);
    let trimmed = out.trim_end_matches('_');

    if trimmed.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Guesses a file extension from the last path segment of a URL.
pub fn extension_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();

    if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(ext)
    } else {
        None
    }
}

/// Hands out archive entry names, suffixing repeats with `_2`, `_3`, ...
#[derive(Debug, Default)]
pub(crate) struct EntryNames {
    used: HashSet<String>,
}

impl EntryNames {
    pub fn claim(&mut self, stem: &str, extension: &str) -> String {
        let mut candidate = format!("{}.{}", stem, extension);
        let mut n = 2;
        while self.used.contains(&candidate) {
            candidate = format!("{}_{}.{}", stem, n, extension);
            n += 1;
        }
        self.used.insert(candidate.clone());
        candidate
    }
}

pub(crate) fn timestamped_name(prefix: &str) -> String {
    format!(
        "{}_{}.zip",
        prefix,
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_example() {
        assert_eq!(sanitize_filename("Kermit Sad!! (v2)"), "kermit_sad_v2");
    }

    #[test]
    fn sanitize_collapses_separators() {
        assert_eq!(sanitize_filename("  Big -- Mood__ Energy  "), "big_mood_energy");
        assert_eq!(sanitize_filename("a\t\nb"), "a_b");
    }

    #[test]
    fn sanitize_strips_path_separators() {
        let out = sanitize_filename("../../etc/passwd");
        assert_eq!(out, "etcpasswd");
        assert!(!out.contains('/') && !out.contains('\\') && !out.contains('.'));
        assert_eq!(sanitize_filename("C:\\Users\\me"), "cusersme");
    }

    #[test]
    fn sanitize_truncates_to_fifty() {
        let long = "word ".repeat(30);
        let out = sanitize_filename(&long);
        assert!(out.len() <= 50);
        assert!(!out.ends_with('_'));
    }

    #[test]
    fn sanitize_falls_back_when_nothing_survives() {
        assert_eq!(sanitize_filename("!!!"), "sticker");
        assert_eq!(sanitize_filename(""), "sticker");
        assert_eq!(sanitize_filename("日本語"), "sticker");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let long = "ab ".repeat(40);
        let inputs: [&str; 6] = [
            "Kermit Sad!! (v2)",
            "__lead and trail__",
            "UPPER lower 123",
            "emoji 😀 face",
            "x-y_z w",
            long.as_str(),
        ];
        for input in inputs {
            let once = sanitize_filename(input);
            assert_eq!(sanitize_filename(&once), once, "input: {:?}", input);
            assert!(once
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
        }
    }

    #[test]
    fn url_extensions() {
        assert_eq!(
            extension_from_url("https://cdn.test/webp/kermit.WEBP?v=3"),
            Some("webp".to_string())
        );
        assert_eq!(extension_from_url("https://cdn.test/image"), None);
        assert_eq!(extension_from_url("https://cdn.test/a.b/c"), None);
    }

    #[test]
    fn entry_names_are_unique() {
        let mut names = EntryNames::default();
        assert_eq!(names.claim("kermit", "png"), "kermit.png");
        assert_eq!(names.claim("kermit", "png"), "kermit_2.png");
        assert_eq!(names.claim("kermit", "png"), "kermit_3.png");
        assert_eq!(names.claim("kermit", "webp"), "kermit.webp");
    }

    #[tokio::test]
    async fn progress_without_channel_is_silent() {
        Progress::none().emit(PackagingEvent::Finished {
            succeeded: 0,
            failed: 0,
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let progress = Progress::new(tx);
        progress.emit(PackagingEvent::Started {
            mode: BulkMode::Archive,
            total: 1,
        });
        assert_eq!(
            rx.recv().await,
            Some(PackagingEvent::Started {
                mode: BulkMode::Archive,
                total: 1
            })
        );
    }
}
