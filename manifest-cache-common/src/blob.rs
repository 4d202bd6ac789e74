//! Object storage for cached manifests and oversized message payloads.
//!
//! Trait-based so the S3 implementation can be swapped for `MockBlobStore`
//! in tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as AwsS3SdkClient;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;
use tracing::{error, info};

pub const DEFAULT_STORE_DOMAIN: &str = "s3.amazonaws.com";

const BLOB_UPLOAD_BODY_SIZE_BYTES: &str = "manifest_cache_blob_upload_body_size_bytes";
const BLOB_UPLOAD_DURATION_SECONDS: &str = "manifest_cache_blob_upload_duration_seconds";
const BLOB_UPLOAD_TOTAL: &str = "manifest_cache_blob_upload_total";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("object not found: s3://{bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("object store operation failed: {0}")]
    OperationFailed(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `contents` under `bucket/key`, returning the public URL of the object.
    async fn put(&self, bucket: &str, key: &str, contents: Bytes) -> Result<String, BlobError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, BlobError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobError>;

    /// The URL an object is publicly reachable at once stored.
    fn public_url(&self, bucket: &str, key: &str) -> String;
}

/// Characters left as is in the path of a public object URL.
const OBJECT_KEY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

fn public_url(domain: &str, bucket: &str, key: &str) -> String {
    let key = utf8_percent_encode(key, OBJECT_KEY);
    format!("https://{bucket}.{domain}/{key}")
}

pub struct S3BlobStore {
    client: AwsS3SdkClient,
    domain: String,
}

impl S3BlobStore {
    pub fn new(client: AwsS3SdkClient, domain: &str) -> Self {
        Self {
            client,
            domain: domain.to_owned(),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, bucket: &str, key: &str, contents: Bytes) -> Result<String, BlobError> {
        let size = contents.len();
        info!(bucket, key, size, "uploading object");
        metrics::histogram!(BLOB_UPLOAD_BODY_SIZE_BYTES).record(size as f64);

        let start = Instant::now();
        let result = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(contents))
            .send()
            .await;
        let elapsed = start.elapsed().as_secs_f64();
        metrics::histogram!(BLOB_UPLOAD_DURATION_SECONDS).record(elapsed);

        match result {
            Ok(_) => {
                metrics::counter!(BLOB_UPLOAD_TOTAL, "outcome" => "success").increment(1);
                info!(bucket, key, "upload complete in {:.2} seconds", elapsed);
                Ok(self.public_url(bucket, key))
            }
            Err(e) => {
                metrics::counter!(BLOB_UPLOAD_TOTAL, "outcome" => "error").increment(1);
                error!(bucket, key, error = %e, "failed to upload object");
                Err(BlobError::OperationFailed(e.to_string()))
            }
        }
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let message = format!("failed to get object: {e}");
                if let aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_) =
                    e.into_service_error()
                {
                    BlobError::NotFound {
                        bucket: bucket.to_owned(),
                        key: key.to_owned(),
                    }
                } else {
                    BlobError::OperationFailed(message)
                }
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| BlobError::OperationFailed(format!("failed to read object body: {e}")))?;

        Ok(body.into_bytes())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobError::OperationFailed(format!("failed to delete object: {e}")))?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        public_url(&self.domain, bucket, key)
    }
}

/// In-memory blob store for tests. Clones share the same objects, so a test can
/// keep a handle while the code under test owns another.
#[derive(Clone, Default)]
pub struct MockBlobStore {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    failing_keys: Arc<Mutex<HashSet<String>>>,
}

impl MockBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation on `key` fail.
    pub fn fail_on(self, key: &str) -> Self {
        self.failing_keys.lock().unwrap().insert(key.to_owned());
        self
    }

    pub fn with_object(self, bucket: &str, key: &str, contents: &[u8]) -> Self {
        self.objects
            .lock()
            .unwrap()
            .insert(object_path(bucket, key), Bytes::copy_from_slice(contents));
        self
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(&object_path(bucket, key))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    fn check(&self, key: &str) -> Result<(), BlobError> {
        if self.failing_keys.lock().unwrap().contains(key) {
            return Err(BlobError::OperationFailed(format!("injected failure for {key}")));
        }
        Ok(())
    }
}

fn object_path(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn put(&self, bucket: &str, key: &str, contents: Bytes) -> Result<String, BlobError> {
        self.check(key)?;
        self.objects
            .lock()
            .unwrap()
            .insert(object_path(bucket, key), contents);
        Ok(self.public_url(bucket, key))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, BlobError> {
        self.check(key)?;
        self.object(bucket, key).ok_or_else(|| BlobError::NotFound {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobError> {
        self.check(key)?;
        self.objects.lock().unwrap().remove(&object_path(bucket, key));
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        public_url(DEFAULT_STORE_DOMAIN, bucket, key)
    }
}
