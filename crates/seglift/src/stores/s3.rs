//! 🪣📡 S3 store: ListObjectsV2 and GetObject, and absolutely nothing else.
//!
//! The AWS SDK brings its own credentials chain (env vars → ~/.aws/config →
//! IAM role → hope), its own retries and its own opinions. We bring a bucket
//! name and a region and let it cook.
//!
//! 🧠 Knowledge graph:
//! - `S3StoreConfig`: bucket, region, optional endpoint override, path-style, retry attempts
//! - `S3ObjectStore::new()` builds the client from config; `from_client()` takes a
//!   pre-built one (tests point it at a wiremock server)
//! - Listing: `prefix` + `continuation_token`, until `is_truncated` says stop

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::config::retry::RetryConfig;
use serde::Deserialize;
use tracing::trace;

use super::{ListPage, ObjectStore};

// ============================================================
//  🔧 S3StoreConfig
// ============================================================

/// 🔧 Configuration for the S3 store.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct S3StoreConfig {
    /// 🪣 Bucket holding the log segments
    pub bucket: String,
    /// 🌎 AWS region, defaults to "sa-east-1" because that's where these logs grew up
    #[serde(default = "default_s3_region")]
    pub region: String,
    /// 🔗 Endpoint override for S3-compatible stores (MinIO, LocalStack, ...)
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// 🛣️ `http://host/bucket/key` instead of `http://bucket.host/key`
    #[serde(default)]
    pub force_path_style: bool,
    /// 🔁 SDK retry attempts per request (throttling happens, a lot)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_s3_region() -> String {
    "sa-east-1".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

// ============================================================
//  🪣 S3ObjectStore
// ============================================================

/// 🪣 [`ObjectStore`] over a real (or convincingly mocked) S3 bucket.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    /// 🚀 Build an SDK client from the environment plus the config's overrides.
    pub async fn new(config: S3StoreConfig) -> Result<Self> {
        if config.bucket.trim().is_empty() {
            bail!("💀 S3 store config has an empty bucket name. We need somewhere to look.");
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .retry_config(RetryConfig::standard().with_max_attempts(config.max_attempts.max(1)));
        if let Some(endpoint_url) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        Ok(Self::from_client(
            aws_sdk_s3::Client::from_conf(s3_config),
            config.bucket,
        ))
    }

    /// 🔧 Wrap an already-configured client.
    pub fn from_client(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_continuation_token(continuation)
            .send()
            .await
            .with_context(|| {
                format!(
                    "💀 ListObjectsV2 failed for s3://{}/{}. Check: bucket name, region, credentials.",
                    self.bucket, prefix
                )
            })?;

        let keys: Vec<String> = response
            .contents()
            .iter()
            .filter_map(|object| object.key().map(str::to_owned))
            .collect();

        let continuation = if response.is_truncated().unwrap_or(false) {
            match response.next_continuation_token() {
                Some(token) => Some(token.to_owned()),
                None => bail!(
                    "💀 s3://{}/{} said the listing was truncated but gave no continuation token",
                    self.bucket,
                    prefix
                ),
            }
        } else {
            None
        };

        trace!(
            "🪣 listed {} keys under s3://{}/{} (more pages: {})",
            keys.len(),
            self.bucket,
            prefix,
            continuation.is_some()
        );
        Ok(ListPage { keys, continuation })
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("💀 GetObject failed for s3://{}/{}", self.bucket, key))?;

        let body = response.body.collect().await.with_context(|| {
            format!(
                "💀 The body of s3://{}/{} stopped streaming halfway through",
                self.bucket, key
            )
        })?;
        Ok(body.into_bytes().to_vec())
    }
}
