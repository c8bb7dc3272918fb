use async_trait::async_trait;
use bytes::Bytes;

use super::bucket::BucketClient;
use crate::error::{AppError, AppResult};

/// Loads the raw bytes behind an image URL.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> AppResult<Bytes>;
}

/// Reads objects of our own bucket through the storage client and falls back
/// to plain HTTP for everything else.
#[derive(Clone)]
pub struct AssetFetcher {
    http: reqwest::Client,
    bucket: Option<BucketClient>,
}

impl AssetFetcher {
    pub fn new(bucket: Option<BucketClient>) -> Self {
        Self {
            http: reqwest::Client::new(),
            bucket,
        }
    }
}

#[async_trait]
impl ImageFetcher for AssetFetcher {
    async fn fetch(&self, url: &str) -> AppResult<Bytes> {
        if let Some(bucket) = &self.bucket {
            if let Some(key) = bucket.key_from_url(url) {
                return bucket
                    .download(key)
                    .await
                    .map_err(|e| AppError::Fetch(format!("{}: {}", url, e)));
            }
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AppError::Fetch(format!("{}: {}", url, e)))?;

        response
            .bytes()
            .await
            .map_err(|e| AppError::Fetch(format!("{}: {}", url, e)))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Serves canned bytes by URL; unknown URLs fail like a 404.
    #[derive(Default)]
    pub struct StaticFetcher {
        pub files: HashMap<String, Bytes>,
        pub calls: AtomicUsize,
    }

    impl StaticFetcher {
        pub fn with(mut self, url: &str, data: Vec<u8>) -> Self {
            self.files.insert(url.to_string(), Bytes::from(data));
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> AppResult<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.files
                .get(url)
                .cloned()
                .ok_or_else(|| AppError::Fetch(format!("{}: 404 Not Found", url)))
        }
    }
}
