use aws_config::Region;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials},
    primitives::ByteStream,
    types::{BucketCannedAcl, ObjectCannedAcl},
    Client, Config,
};
use bytes::Bytes;

use crate::{config::StorageConfig, error::AppResult};

/// Path prefixes used inside the sticker bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetPrefix {
    /// Original uploads, untouched.
    Source,
    /// Re-encoded display images.
    Webp,
    Thumbnails,
    Packs,
}

impl AssetPrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetPrefix::Source => "source",
            AssetPrefix::Webp => "webp",
            AssetPrefix::Thumbnails => "thumbnails",
            AssetPrefix::Packs => "packs",
        }
    }

    pub fn key(self, file_name: &str) -> String {
        format!("{}/{}", self.as_str(), file_name)
    }
}

#[derive(Clone)]
pub struct BucketClient {
    client: Client,
    config: StorageConfig,
}

impl BucketClient {
    pub async fn new(config: &StorageConfig) -> AppResult<Self> {
        let creds = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "sticker-bucket",
        );

        let s3_config = Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint)
            .credentials_provider(creds)
            .force_path_style(true)
            .build();

        let client = Client::from_conf(s3_config);

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    pub async fn ensure_bucket(&self) -> AppResult<()> {
        let bucket = &self.config.bucket;
        let result = self.client.head_bucket().bucket(bucket).send().await;

        if result.is_err() {
            self.client
                .create_bucket()
                .bucket(bucket)
                .acl(BucketCannedAcl::PublicRead)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create bucket: {}", e))?;
            tracing::info!("Created bucket: {}", bucket);
        }

        Ok(())
    }

    pub async fn upload(&self, key: &str, data: Bytes, content_type: &str) -> AppResult<String> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to upload {}: {}", key, e))?;

        Ok(self.public_url(key))
    }

    pub async fn download(&self, key: &str) -> AppResult<Bytes> {
        let result = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to download {}: {}", key, e))?;

        let data = result
            .body
            .collect()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read object body: {}", e))?;

        Ok(data.into_bytes())
    }

    pub async fn delete(&self, key: &str) -> AppResult<()> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete {}: {}", key, e))?;

        Ok(())
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url(), key)
    }

    /// Reverse of [`public_url`](Self::public_url). Returns `None` for URLs
    /// that do not point into this bucket.
    pub fn key_from_url<'a>(&self, url: &'a str) -> Option<&'a str> {
        strip_base(&self.base_url(), url)
    }

    fn base_url(&self) -> String {
        let root = self
            .config
            .public_url
            .as_deref()
            .unwrap_or(&self.config.endpoint);
        format!("{}/{}", root.trim_end_matches('/'), self.config.bucket)
    }
}

fn strip_base<'a>(base: &str, url: &'a str) -> Option<&'a str> {
    url.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|key| !key.is_empty())
}

pub fn content_type_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "zip" => "application/zip",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

pub fn extension_from_content_type(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "application/json" => "json",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_base_extracts_key() {
        let base = "http://localhost:9000/stickers";
        assert_eq!(
            strip_base(base, "http://localhost:9000/stickers/webp/kermit.webp"),
            Some("webp/kermit.webp")
        );
        assert_eq!(strip_base(base, "https://cdn.example.com/webp/kermit.webp"), None);
        assert_eq!(strip_base(base, "http://localhost:9000/stickers/"), None);
    }

    #[test]
    fn prefix_keys() {
        assert_eq!(AssetPrefix::Thumbnails.key("a.webp"), "thumbnails/a.webp");
        assert_eq!(AssetPrefix::Source.key("a.png"), "source/a.png");
    }

    #[test]
    fn content_types_round_trip_common_formats() {
        assert_eq!(content_type_for_extension("PNG"), "image/png");
        assert_eq!(extension_from_content_type("image/webp"), "webp");
        assert_eq!(extension_from_content_type("text/plain"), "bin");
    }
}
