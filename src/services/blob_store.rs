//! Blob storage for uploaded file payloads.
//!
//! `S3BlobStore` handles AWS S3, Cloudflare R2 and MinIO through a custom
//! endpoint with path-style addressing. `MemoryBlobStore` keeps objects in
//! process for tests and local runs without object storage.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::{debug, info, warn};

use crate::config::S3Config;
use crate::error::{AppError, AppResult};

/// Size of one multipart part. S3 requires at least 5 MiB for every part but the last.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// Chunked payload fed to `put_stream`. An `Err` item aborts the upload.
pub type ChunkStream = BoxStream<'static, Result<Bytes, BlobError>>;

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub storage_key: String,
    pub public_url: String,
    pub bytes_written: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The payload stream ended with an error
    #[error("upload aborted: {0}")]
    Aborted(String),
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("blob backend error: {0}")]
    Backend(String),
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(key) => AppError::NotFound(format!("Object {}", key)),
            other => AppError::Storage(other.to_string()),
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream `body` to `key`. Nothing is left behind when the stream fails.
    async fn put_stream(
        &self,
        key: &str,
        body: ChunkStream,
        content_type: &str,
    ) -> Result<StoredBlob, BlobError>;

    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    async fn exists(&self, key: &str) -> Result<bool, BlobError>;

    fn public_url(&self, key: &str) -> String;
}

/// Build the object key for an uploaded file.
///
/// Format: `files/{folder_id}/{uuid}-{sanitized_name}`
pub fn object_key(folder_id: &str, file_name: &str) -> String {
    let sanitized: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = if sanitized.is_empty() {
        "file".to_string()
    } else {
        sanitized
    };
    format!("files/{}/{}-{}", folder_id, uuid::Uuid::now_v7(), sanitized)
}

fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

// ============================================================================
// S3 / R2 / MinIO
// ============================================================================

/// Runs a cleanup future when dropped while still armed.
///
/// Covers callers that drop `put_stream` mid-flight, which would otherwise
/// leave an open multipart upload behind.
struct AbortOnDrop<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    cleanup: Option<F>,
}

impl<F> AbortOnDrop<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    fn disarm(mut self) {
        self.cleanup = None;
    }

    /// Run the cleanup now instead of on drop.
    async fn run(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.await;
        }
    }
}

impl<F> Drop for AbortOnDrop<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    fn drop(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup);
            }
            Err(_) => warn!("Upload dropped outside a runtime, cleanup skipped"),
        }
    }
}

/// S3 compatible blob store.
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    region: String,
    endpoint: Option<String>,
    public_base_url: Option<String>,
}

impl S3BlobStore {
    /// Create a new S3 client from configuration and make sure the bucket exists.
    pub async fn new(config: &S3Config) -> AppResult<Self> {
        let credentials =
            Credentials::new(&config.access_key, &config.secret_key, None, None, "nsm");

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true); // Required for MinIO and R2

        if let Some(ref endpoint) = config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let store = Self {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
            public_base_url: config.public_base_url.clone(),
        };

        store.ensure_bucket_exists().await?;

        info!("S3 blob store initialized: bucket={}", config.bucket);

        Ok(store)
    }

    /// Ensure the bucket exists, creating it if necessary.
    async fn ensure_bucket_exists(&self) -> AppResult<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!("S3 bucket '{}' exists", self.bucket);
                Ok(())
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    info!("Creating S3 bucket '{}'", self.bucket);
                    self.client
                        .create_bucket()
                        .bucket(&self.bucket)
                        .send()
                        .await
                        .map_err(|e| {
                            AppError::Storage(format!("Failed to create bucket: {}", e))
                        })?;
                    Ok(())
                } else {
                    Err(AppError::Storage(format!(
                        "Failed to access bucket '{}': {}",
                        self.bucket, service_error
                    )))
                }
            }
        }
    }

    async fn put_single(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| BlobError::Backend(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPart, BlobError> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| BlobError::Backend(DisplayErrorContext(&e).to_string()))?;

        Ok(CompletedPart::builder()
            .set_e_tag(output.e_tag().map(String::from))
            .part_number(part_number)
            .build())
    }

    /// Upload the remaining stream as parts of an already started multipart upload.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first_part: Bytes,
        mut body: ChunkStream,
    ) -> Result<u64, BlobError> {
        let mut parts = vec![self.upload_part(key, upload_id, 1, first_part.clone()).await?];
        let mut written = first_part.len() as u64;
        let mut buffer = BytesMut::with_capacity(PART_SIZE);

        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
            if buffer.len() >= PART_SIZE {
                let part = buffer.split().freeze();
                written += part.len() as u64;
                let number = parts.len() as i32 + 1;
                parts.push(self.upload_part(key, upload_id, number, part).await?);
            }
        }

        if !buffer.is_empty() {
            let part = buffer.freeze();
            written += part.len() as u64;
            let number = parts.len() as i32 + 1;
            parts.push(self.upload_part(key, upload_id, number, part).await?);
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| BlobError::Backend(DisplayErrorContext(&e).to_string()))?;

        Ok(written)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_stream(
        &self,
        key: &str,
        mut body: ChunkStream,
        content_type: &str,
    ) -> Result<StoredBlob, BlobError> {
        let mut buffer = BytesMut::with_capacity(PART_SIZE);

        // Fill the first part; payloads that end before it use a single PutObject.
        while buffer.len() < PART_SIZE {
            match body.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk?),
                None => {
                    let data = buffer.freeze();
                    let bytes_written = data.len() as u64;
                    self.put_single(key, data, content_type).await?;
                    return Ok(StoredBlob {
                        storage_key: key.to_string(),
                        public_url: self.public_url(key),
                        bytes_written,
                    });
                }
            }
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BlobError::Backend(DisplayErrorContext(&e).to_string()))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BlobError::Backend("multipart upload has no id".to_string()))?
            .to_string();

        debug!(key = %key, upload_id = %upload_id, "Multipart upload started");

        let abort = {
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let upload_id = upload_id.clone();
            AbortOnDrop::new(async move {
                if let Err(e) = client
                    .abort_multipart_upload()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        "Failed to abort multipart upload: {}",
                        DisplayErrorContext(&e)
                    );
                }
            })
        };

        match self
            .upload_parts(key, &upload_id, buffer.freeze(), body)
            .await
        {
            Ok(bytes_written) => {
                abort.disarm();
                Ok(StoredBlob {
                    storage_key: key.to_string(),
                    public_url: self.public_url(key),
                    bytes_written,
                })
            }
            Err(e) => {
                abort.run().await;
                Err(e)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobError::Backend(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(BlobError::Backend(service_error.to_string()))
                }
            }
        }
    }

    fn public_url(&self, key: &str) -> String {
        let key = encode_key(key);
        match (&self.public_base_url, &self.endpoint) {
            (Some(base), _) => format!("{}/{}", base.trim_end_matches('/'), key),
            (None, Some(endpoint)) => {
                format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key)
            }
            (None, None) => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            ),
        }
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
}

/// In-process blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    /// Fail uploads once this many bytes have been received
    fail_after: Option<u64>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose uploads fail after `bytes` bytes, for exercising error paths.
    pub fn failing_after(bytes: u64) -> Self {
        Self {
            objects: Mutex::default(),
            fail_after: Some(bytes),
        }
    }

    /// Stored payload and content type for `key`.
    pub fn get(&self, key: &str) -> Option<(Bytes, String)> {
        self.lock()
            .get(key)
            .map(|o| (o.data.clone(), o.content_type.clone()))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredObject>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_stream(
        &self,
        key: &str,
        mut body: ChunkStream,
        content_type: &str,
    ) -> Result<StoredBlob, BlobError> {
        let mut buffer = BytesMut::new();

        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
            if let Some(limit) = self.fail_after
                && buffer.len() as u64 > limit
            {
                return Err(BlobError::Backend(format!(
                    "simulated failure after {} bytes",
                    limit
                )));
            }
        }

        let data = buffer.freeze();
        let bytes_written = data.len() as u64;
        self.lock().insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );

        Ok(StoredBlob {
            storage_key: key.to_string(),
            public_url: self.public_url(key),
            bytes_written,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        Ok(self.lock().contains_key(key))
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://{}", encode_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn chunks(parts: Vec<Result<Bytes, BlobError>>) -> ChunkStream {
        stream::iter(parts).boxed()
    }

    #[test]
    fn test_object_key_sanitizes_name() {
        let key = object_key("root", "my report (final).pdf");
        assert!(key.starts_with("files/root/"));
        assert!(key.ends_with("-my_report__final_.pdf"));
    }

    #[test]
    fn test_object_key_for_empty_name() {
        assert!(object_key("root", "").ends_with("-file"));
    }

    #[tokio::test]
    async fn test_abort_guard_runs_cleanup_when_dropped() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let guard = AbortOnDrop::new(async move {
            let _ = tx.send(());
        });

        drop(guard);

        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_abort_guard_disarmed_skips_cleanup() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let guard = AbortOnDrop::new(async move {
            let _ = tx.send(());
        });

        guard.disarm();

        // The cleanup future, and its sender, are dropped unrun
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_abort_guard_run_awaits_cleanup() {
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = std::sync::Arc::clone(&ran);
        let guard = AbortOnDrop::new(async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        guard.run().await;

        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_encode_key_keeps_separators() {
        assert_eq!(encode_key("files/a b/c"), "files/a%20b/c");
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        let body = chunks(vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))]);

        let stored = store.put_stream("k/1", body, "text/plain").await.unwrap();

        assert_eq!(stored.bytes_written, 11);
        assert_eq!(stored.public_url, "memory://k/1");
        let (data, content_type) = store.get("k/1").unwrap();
        assert_eq!(&data[..], b"hello world");
        assert_eq!(content_type, "text/plain");
        assert!(store.exists("k/1").await.unwrap());

        store.delete("k/1").await.unwrap();
        assert!(!store.exists("k/1").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_keeps_nothing_on_stream_error() {
        let store = MemoryBlobStore::new();
        let body = chunks(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(BlobError::Aborted("client went away".into())),
        ]);

        let result = store.put_stream("k/2", body, "text/plain").await;

        assert!(matches!(result, Err(BlobError::Aborted(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = MemoryBlobStore::failing_after(4);
        let body = chunks(vec![Ok(Bytes::from_static(b"too many bytes"))]);

        let result = store.put_stream("k/3", body, "text/plain").await;

        assert!(matches!(result, Err(BlobError::Backend(_))));
        assert!(store.is_empty());
    }
}
