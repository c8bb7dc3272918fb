use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::AppResult,
    models::{Sticker, StickerUpdate},
    services::stickers::{slugify, StickersService},
};

/// Filename keyword → tag. A keyword matches any filename token that
/// starts with it, so `laughing` hits `laugh`.
const KEYWORD_TAGS: &[(&str, &str)] = &[
    ("happy", "happy"),
    ("smile", "happy"),
    ("joy", "happy"),
    ("lol", "funny"),
    ("laugh", "funny"),
    ("haha", "funny"),
    ("sad", "sad"),
    ("cry", "sad"),
    ("tear", "sad"),
    ("angry", "angry"),
    ("mad", "angry"),
    ("rage", "angry"),
    ("love", "love"),
    ("heart", "love"),
    ("kiss", "love"),
    ("wow", "surprised"),
    ("shock", "surprised"),
    ("omg", "surprised"),
    ("think", "thinking"),
    ("hmm", "thinking"),
    ("cool", "cool"),
    ("party", "celebrate"),
    ("dance", "celebrate"),
    ("yay", "celebrate"),
    ("sleep", "tired"),
    ("tired", "tired"),
    ("yawn", "tired"),
    ("wave", "greeting"),
    ("hello", "greeting"),
    ("hi", "greeting"),
    ("bye", "greeting"),
];

/// One raw file from a batch upload.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub data: Bytes,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchUploadReport {
    pub created: Vec<Sticker>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataEntry {
    pub slug: String,
    pub name: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Default, Serialize)]
pub struct MetadataImportReport {
    pub updated: usize,
    pub errors: Vec<String>,
}

pub struct ImportService {
    stickers: StickersService,
}

impl ImportService {
    pub fn new(stickers: StickersService) -> Self {
        Self { stickers }
    }

    /// Create one sticker per file. Names and tags come from the filename;
    /// a failing file is reported and the batch moves on.
    pub async fn batch_upload(&self, files: Vec<UploadedFile>) -> BatchUploadReport {
        let mut report = BatchUploadReport::default();

        for file in files {
            match self.import_file(&file).await {
                Ok(sticker) => report.created.push(sticker),
                Err(e) => {
                    tracing::warn!("Batch upload of {} failed: {}", file.file_name, e);
                    report.errors.push(format!("{}: {}", file.file_name, e));
                }
            }
        }

        tracing::info!(
            "Batch upload finished: {} created, {} failed",
            report.created.len(),
            report.errors.len()
        );
        report
    }

    async fn import_file(&self, file: &UploadedFile) -> AppResult<Sticker> {
        let name = display_name(&file.file_name);
        let slug = self.stickers.unique_slug(&slugify(&name)).await?;
        let tags = derive_tags(&file.file_name);

        self.stickers
            .create(&name, &slug, &tags, file.data.clone())
            .await
    }

    /// Apply `{slug, name?, tags?}` updates; unknown slugs are reported.
    pub async fn import_metadata(&self, entries: Vec<MetadataEntry>) -> MetadataImportReport {
        let mut report = MetadataImportReport::default();

        for entry in entries {
            let update = StickerUpdate {
                name: entry.name,
                slug: None,
                tags: entry.tags,
            };
            match self.stickers.update_by_slug(&entry.slug, update).await {
                Ok(_) => report.updated += 1,
                Err(e) => {
                    tracing::warn!("Metadata import for {} failed: {}", entry.slug, e);
                    report.errors.push(format!("{}: {}", entry.slug, e));
                }
            }
        }

        report
    }
}

fn file_stem(file_name: &str) -> &str {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    // ".png" has an extension and no name.
    base.rsplit_once('.').map_or(base, |(stem, _)| stem)
}

fn tokens(file_name: &str) -> impl Iterator<Item = String> + '_ {
    file_stem(file_name)
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_ascii_lowercase)
}

/// "kermit_sad-face.png" → "Kermit Sad Face"
pub fn display_name(file_name: &str) -> String {
    let words: Vec<String> = tokens(file_name)
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();

    if words.is_empty() {
        "Sticker".to_string()
    } else {
        words.join(" ")
    }
}

pub fn derive_tags(file_name: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for token in tokens(file_name) {
        for (keyword, tag) in KEYWORD_TAGS {
            if token.starts_with(keyword) && !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_come_from_the_file_stem() {
        assert_eq!(display_name("kermit_sad-face.png"), "Kermit Sad Face");
        assert_eq!(display_name("uploads/Piggy  WOW.webp"), "Piggy Wow");
        assert_eq!(display_name(".png"), "Sticker");
        assert_eq!(display_name("uploads/.webp"), "Sticker");
        assert_eq!(display_name("README"), "Readme");
        assert_eq!(display_name("___"), "Sticker");
    }

    #[test]
    fn tags_follow_keywords() {
        assert_eq!(derive_tags("kermit_laughing_lol.png"), vec!["funny"]);
        assert_eq!(
            derive_tags("piggy-heart-crying.gif"),
            vec!["love", "sad"]
        );
        assert!(derive_tags("gonzo.png").is_empty());
    }

    #[test]
    fn keywords_match_token_prefixes_only() {
        // "this" contains "hi" but does not start with it
        assert!(derive_tags("this_one.png").is_empty());
        assert_eq!(derive_tags("hi_there.png"), vec!["greeting"]);
    }
}
