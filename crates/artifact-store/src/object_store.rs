use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Clone, Debug, Error)]
pub enum UploadError {
    #[error("storage backend failure: {0}")]
    Storage(String),

    #[error("uploader shut down")]
    Closed,
}

/// Destination for artifact payloads.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` at `key`, overwriting any previous object, and return
    /// the destination URI.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, UploadError>;
}

/// S3 (or S3-compatible) backend.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    /// Build from ambient AWS configuration (env, profile, instance role).
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket: bucket.into(),
        }
    }

    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, UploadError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| UploadError::Storage(err.to_string()))?;
        debug!(target: "artifact-store", bucket = %self.bucket, key, "object uploaded");
        Ok(format!("s3://{}/{}", self.bucket, key))
    }
}

/// In-memory backend for tests; can be told to fail the next N puts.
#[derive(Default)]
pub struct MemoryStore {
    objects: DashMap<String, Vec<u8>>,
    fail_next: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: u32) {
        self.fail_next.store(times, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, UploadError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(UploadError::Storage("injected failure".into()));
        }
        self.objects.insert(key.to_string(), bytes);
        Ok(format!("mem://{key}"))
    }
}
