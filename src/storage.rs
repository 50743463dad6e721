//! Object store uploads for processed images.
//!
//! The store only puts objects and hands back their public locator. Retrying a
//! failed put is the worker's call, never the store's.

use crate::error::StorageError;
use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `body` under `key` and returns its public locator.
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError>;
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    /// Base URL for public locators; virtual-hosted S3 URLs when unset
    pub public_base_url: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "product-images".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            force_path_style: false,
            public_base_url: None,
        }
    }
}

impl S3Config {
    /// Public, unsigned URL of an object.
    pub fn object_url(&self, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("https://{}.s3.amazonaws.com/{}", self.bucket, key),
        }
    }
}

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    config: S3Config,
}

impl S3Store {
    pub async fn new(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        info!(bucket = %config.bucket, region = %config.region, "S3 store initialized");

        Self {
            client: Client::from_conf(s3_config),
            config,
        }
    }

    pub fn config(&self) -> &S3Config {
        &self.config
    }

    pub async fn health_check(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(|e| StorageError {
                key: String::new(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        debug!(bucket = %self.config.bucket, key = %key, size = body.len(), "Uploading object");
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StorageError {
                key: key.to_string(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(self.config.object_url(key))
    }
}

/// Strictly increasing nanosecond timestamps.
///
/// Two calls never return the same value, even within one clock tick.
#[derive(Debug, Default)]
pub struct UniqueSuffix {
    last: AtomicI64,
}

impl UniqueSuffix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// `products/<record_id>/<file name>_<suffix><ext>`
pub fn object_key(record_id: i64, image_ref: &str, suffix: i64) -> String {
    format!(
        "products/{}/{}_{}{}",
        record_id,
        crate::file_name_of(image_ref),
        suffix,
        crate::extension_of(image_ref).unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_virtual_hosted_style() {
        let config = S3Config {
            bucket: "test-bucket".to_string(),
            ..S3Config::default()
        };
        assert_eq!(
            config.object_url("products/1/a.jpg_1.jpg"),
            "https://test-bucket.s3.amazonaws.com/products/1/a.jpg_1.jpg"
        );
    }

    #[test]
    fn test_object_url_with_public_base() {
        let config = S3Config {
            bucket: "test-bucket".to_string(),
            public_base_url: Some("http://localhost:9000/test-bucket/".to_string()),
            ..S3Config::default()
        };
        assert_eq!(
            config.object_url("products/1/a.png_1.png"),
            "http://localhost:9000/test-bucket/products/1/a.png_1.png"
        );
    }

    #[test]
    fn test_object_key_layout() {
        assert_eq!(
            object_key(42, "https://cdn.example.com/img/shoe.jpg?size=xl", 1700),
            "products/42/shoe.jpg_1700.jpg"
        );
        assert_eq!(
            object_key(42, "https://cdn.example.com/img/raw", 5),
            "products/42/raw_5"
        );
    }

    #[test]
    fn test_unique_suffix_is_strictly_increasing() {
        let suffix = UniqueSuffix::new();
        let mut prev = suffix.next();
        for _ in 0..1000 {
            let next = suffix.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_same_reference_never_collides() {
        let suffix = UniqueSuffix::new();
        let reference = "https://cdn.example.com/a.png";
        assert_ne!(
            object_key(1, reference, suffix.next()),
            object_key(1, reference, suffix.next())
        );
    }
}
