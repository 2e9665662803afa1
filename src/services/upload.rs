//! Streaming upload ingest.
//!
//! One file part is forwarded chunk by chunk to the blob store while a
//! throttled callback persists progress and publishes progress events.
//! Completion, rejection and failure each end in exactly one terminal
//! progress write and event.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::config::UploadSettings;
use crate::error::{AppError, AppResult};
use crate::models::events::now_millis;
use crate::models::file::is_allowed_mime_type;
use crate::models::progress::compute_progress;
use crate::models::{
    FileEvent, FileEventKind, FileRecord, NewFile, ProgressEvent, ProgressEventKind,
    ProgressUpdate, UploadResponse, UploadStatus,
};
use crate::services::best_effort::best_effort;
use crate::services::blob_store::{BlobError, BlobStore, object_key};
use crate::services::file_repository::FileRepository;
use crate::services::progress_store::ProgressStore;
use crate::services::queue::{MessageQueue, QueueName};
use crate::services::throttle::Throttle;

/// Chunks buffered between the request body and the blob writer.
pub const CHANNEL_DEPTH: usize = 8;

/// Identifiers and declared size of one upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub upload_id: String,
    pub folder_id: String,
    /// Total size announced by the client, if any
    pub declared_size: Option<u64>,
}

/// The file part of the multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub file_name: String,
    pub mime_type: String,
}

// ============================================================================
// Progress reporting
// ============================================================================

#[derive(Default)]
struct ReporterState {
    last_reported: Option<u64>,
    terminal: bool,
}

/// Serializes progress writes and events of one upload.
///
/// Reported byte counts strictly increase and nothing is reported after the
/// terminal write.
struct ProgressReporter {
    upload_id: String,
    file_name: String,
    declared_size: Option<u64>,
    progress: Arc<dyn ProgressStore>,
    queue: Arc<dyn MessageQueue>,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    /// Create the record with whatever is known before the first byte.
    async fn init(&self) {
        let update = ProgressUpdate::uploading(&self.upload_id, 0)
            .with_file(Some(self.file_name.clone()), self.declared_size);
        best_effort(
            "Progress init",
            &self.upload_id,
            self.progress.upsert(&update),
        )
        .await;
    }

    /// Throttled progress write.
    async fn report(&self, uploaded_bytes: u64) {
        let mut state = self.state.lock().await;
        if state.terminal || state.last_reported.is_some_and(|last| uploaded_bytes <= last) {
            return;
        }
        state.last_reported = Some(uploaded_bytes);

        self.write(uploaded_bytes, self.declared_size, UploadStatus::Uploading)
            .await;
    }

    /// Terminal write. Only the first call has an effect.
    async fn finish(&self, status: UploadStatus, uploaded_bytes: u64, file_size: Option<u64>) {
        let mut state = self.state.lock().await;
        if state.terminal {
            return;
        }
        state.terminal = true;

        self.write(uploaded_bytes, file_size, status).await;
    }

    async fn write(&self, uploaded_bytes: u64, file_size: Option<u64>, status: UploadStatus) {
        let update = ProgressUpdate::uploading(&self.upload_id, uploaded_bytes)
            .with_file(Some(self.file_name.clone()), file_size)
            .with_status(status);
        best_effort(
            "Progress write",
            &self.upload_id,
            self.progress.upsert(&update),
        )
        .await;

        let event = ProgressEvent {
            event: match status {
                UploadStatus::Uploading => ProgressEventKind::UploadProgress,
                UploadStatus::Completed => ProgressEventKind::UploadCompleted,
                UploadStatus::Failed => ProgressEventKind::UploadFailed,
            },
            upload_id: self.upload_id.clone(),
            status,
            progress: Some(match status {
                UploadStatus::Completed => 100.0,
                _ => compute_progress(uploaded_bytes, file_size),
            }),
            uploaded_bytes: Some(uploaded_bytes),
            file_size,
            file_name: Some(self.file_name.clone()),
            at: Some(now_millis()),
        };
        publish(
            self.queue.as_ref(),
            QueueName::ProgressEvents,
            &self.upload_id,
            &event,
        )
        .await;
    }
}

async fn publish<T: serde::Serialize>(
    queue: &dyn MessageQueue,
    queue_name: QueueName,
    upload_id: &str,
    event: &T,
) {
    match serde_json::to_string(event) {
        Ok(body) => {
            best_effort("Event publish", upload_id, queue.publish(queue_name, &body)).await;
        }
        Err(e) => warn!(upload_id = %upload_id, "Failed to serialize event: {}", e),
    }
}

/// Marks the upload failed if the session is dropped before a terminal write,
/// e.g. when the client disconnects and actix drops the handler future.
struct FailGuard {
    reporter: Option<Arc<ProgressReporter>>,
    received: Arc<AtomicU64>,
}

impl FailGuard {
    fn disarm(&mut self) {
        self.reporter = None;
    }
}

impl Drop for FailGuard {
    fn drop(&mut self) {
        let Some(reporter) = self.reporter.take() else {
            return;
        };
        let received = self.received.load(Ordering::SeqCst);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(upload_id = %reporter.upload_id, "Upload aborted by client");
                handle.spawn(async move {
                    let declared = reporter.declared_size;
                    reporter
                        .finish(UploadStatus::Failed, received, declared)
                        .await;
                });
            }
            Err(_) => warn!(
                upload_id = %reporter.upload_id,
                "Upload aborted outside a runtime, failure not recorded"
            ),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Upload ingest service, shared by all requests.
#[derive(Clone)]
pub struct UploadPipeline {
    progress: Arc<dyn ProgressStore>,
    queue: Arc<dyn MessageQueue>,
    blobs: Arc<dyn BlobStore>,
    files: Arc<dyn FileRepository>,
    settings: UploadSettings,
}

impl UploadPipeline {
    pub fn new(
        progress: Arc<dyn ProgressStore>,
        queue: Arc<dyn MessageQueue>,
        blobs: Arc<dyn BlobStore>,
        files: Arc<dyn FileRepository>,
        settings: UploadSettings,
    ) -> Self {
        Self {
            progress,
            queue,
            blobs,
            files,
            settings,
        }
    }

    pub fn max_upload_size(&self) -> u64 {
        self.settings.max_upload_size
    }

    /// Start an upload for `part`.
    ///
    /// A disallowed MIME type is recorded and published as failed and
    /// returned as `UnsupportedMediaType` without touching the blob store.
    pub async fn start(&self, request: UploadRequest, part: FilePart) -> AppResult<UploadSession> {
        let reporter = Arc::new(ProgressReporter {
            upload_id: request.upload_id.clone(),
            file_name: part.file_name.clone(),
            declared_size: request.declared_size,
            progress: Arc::clone(&self.progress),
            queue: Arc::clone(&self.queue),
            state: Mutex::new(ReporterState::default()),
        });

        if !is_allowed_mime_type(&part.mime_type) {
            warn!(
                upload_id = %request.upload_id,
                mime_type = %part.mime_type,
                "Rejected upload with unsupported file type"
            );
            reporter
                .finish(UploadStatus::Failed, 0, request.declared_size)
                .await;
            return Err(AppError::UnsupportedMediaType(part.mime_type));
        }

        // Armed before the first write so a drop during init still ends failed.
        let received = Arc::new(AtomicU64::new(0));
        let guard = FailGuard {
            reporter: Some(Arc::clone(&reporter)),
            received: Arc::clone(&received),
        };

        reporter.init().await;

        info!(
            upload_id = %request.upload_id,
            file_name = %part.file_name,
            declared_size = ?request.declared_size,
            "Upload started"
        );

        Ok(UploadSession {
            pipeline: self.clone(),
            request,
            part,
            reporter,
            received,
            guard,
        })
    }
}

enum FeedFailure {
    TooLarge,
    Client(String),
}

/// An upload between `start` and its terminal outcome.
pub struct UploadSession {
    pipeline: UploadPipeline,
    request: UploadRequest,
    part: FilePart,
    reporter: Arc<ProgressReporter>,
    received: Arc<AtomicU64>,
    guard: FailGuard,
}

impl UploadSession {
    pub fn upload_id(&self) -> &str {
        &self.request.upload_id
    }

    /// Stream `source` to the blob store and finalize the upload.
    pub async fn ingest<S, E>(mut self, source: S) -> AppResult<UploadResponse>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let upload_id = self.request.upload_id.clone();
        let max_size = self.pipeline.settings.max_upload_size;
        let storage_key = object_key(&self.request.folder_id, &self.part.file_name);

        let throttle = {
            let reporter = Arc::clone(&self.reporter);
            Throttle::new(self.pipeline.settings.progress_throttle, move |bytes: u64| {
                let reporter = Arc::clone(&reporter);
                async move { reporter.report(bytes).await }
            })
        };

        let (tx, rx) = mpsc::channel::<Result<Bytes, BlobError>>(CHANNEL_DEPTH);
        let body = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        let received = Arc::clone(&self.received);
        let feed = async move {
            futures_util::pin_mut!(source);
            let mut total: u64 = 0;
            let mut failure = None;

            while let Some(chunk) = source.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let reason = e.to_string();
                        let _ = tx.send(Err(BlobError::Aborted(reason.clone()))).await;
                        failure = Some(FeedFailure::Client(reason));
                        break;
                    }
                };

                total += chunk.len() as u64;
                received.store(total, Ordering::SeqCst);
                if total > max_size {
                    let _ = tx
                        .send(Err(BlobError::Aborted("size limit exceeded".to_string())))
                        .await;
                    failure = Some(FeedFailure::TooLarge);
                    break;
                }

                throttle.call(total);

                // The blob writer dropped the receiver: it failed and reports why.
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }

            throttle.cancel();
            (total, failure)
        };

        let upload = self
            .pipeline
            .blobs
            .put_stream(&storage_key, body, &self.part.mime_type);

        let ((total, failure), stored) = tokio::join!(feed, upload);

        match failure {
            Some(FeedFailure::TooLarge) => {
                warn!(upload_id = %upload_id, max_size, "Upload exceeded size limit");
                self.fail(total).await;
                return Err(AppError::PayloadTooLarge {
                    max_bytes: max_size,
                });
            }
            Some(FeedFailure::Client(reason)) => {
                warn!(upload_id = %upload_id, "Upload stream broke: {}", reason);
                self.fail(total).await;
                return Err(AppError::MalformedMultipart(reason));
            }
            None => {}
        }

        let stored = match stored {
            Ok(stored) => stored,
            Err(e) => {
                warn!(upload_id = %upload_id, "Blob upload failed: {}", e);
                self.fail(total).await;
                return Err(AppError::UploadBackendFailure(e.to_string()));
            }
        };

        let record = match self.create_record(&stored.storage_key, &stored.public_url, total).await {
            Ok(record) => record,
            Err(e) => {
                best_effort(
                    "Orphan blob delete",
                    &upload_id,
                    self.pipeline.blobs.delete(&stored.storage_key),
                )
                .await;
                self.fail(total).await;
                return Err(e);
            }
        };

        self.reporter
            .finish(UploadStatus::Completed, total, Some(total))
            .await;
        self.guard.disarm();

        let file_event = FileEvent {
            event: FileEventKind::FileCreated,
            file_id: record.id.to_string(),
            folder_id: Some(record.folder_id.clone()),
            name: Some(record.name.clone()),
            mime_type: Some(record.mime_type.clone()),
            file_size: Some(record.file_size),
            at: Some(now_millis()),
        };
        publish(
            self.pipeline.queue.as_ref(),
            QueueName::FileEvents,
            &upload_id,
            &file_event,
        )
        .await;

        info!(
            upload_id = %upload_id,
            file_id = %record.id,
            bytes = total,
            "Upload completed"
        );

        Ok(UploadResponse {
            upload_id,
            file: record,
        })
    }

    async fn create_record(
        &self,
        storage_key: &str,
        public_url: &str,
        file_size: u64,
    ) -> AppResult<FileRecord> {
        self.pipeline
            .files
            .create(NewFile {
                name: self.part.file_name.clone(),
                original_name: self.part.file_name.clone(),
                storage_key: storage_key.to_string(),
                public_url: public_url.to_string(),
                file_size,
                mime_type: self.part.mime_type.clone(),
                folder_id: self.request.folder_id.clone(),
            })
            .await
    }

    async fn fail(&mut self, received: u64) {
        self.reporter
            .finish(UploadStatus::Failed, received, self.request.declared_size)
            .await;
        self.guard.disarm();
        debug!(upload_id = %self.request.upload_id, "Upload marked failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileEvent, UploadProgress};
    use crate::services::blob_store::MemoryBlobStore;
    use crate::services::memory::{MemoryFileRepository, MemoryProgressStore};
    use crate::services::queue::{MemoryQueue, PollOptions};
    use std::time::Duration;

    struct Harness {
        progress: Arc<MemoryProgressStore>,
        queue: Arc<MemoryQueue>,
        blobs: Arc<MemoryBlobStore>,
        files: Arc<MemoryFileRepository>,
        pipeline: UploadPipeline,
    }

    fn harness_with(blobs: MemoryBlobStore, max_upload_size: u64) -> Harness {
        let progress = Arc::new(MemoryProgressStore::new(Duration::from_secs(3600)));
        let queue = Arc::new(MemoryQueue::new());
        let blobs = Arc::new(blobs);
        let files = Arc::new(MemoryFileRepository::new());
        let pipeline = UploadPipeline::new(
            progress.clone(),
            queue.clone(),
            blobs.clone(),
            files.clone(),
            UploadSettings {
                max_upload_size,
                progress_throttle: Duration::ZERO,
                progress_ttl: Duration::from_secs(3600),
            },
        );
        Harness {
            progress,
            queue,
            blobs,
            files,
            pipeline,
        }
    }

    /// Progress store whose first write never completes.
    struct StallingProgressStore {
        inner: Arc<MemoryProgressStore>,
        stalled: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl ProgressStore for StallingProgressStore {
        async fn upsert(&self, update: &ProgressUpdate) -> AppResult<UploadProgress> {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.upsert(update).await
        }

        async fn get(&self, upload_id: &str) -> AppResult<Option<UploadProgress>> {
            self.inner.get(upload_id).await
        }

        async fn delete(&self, upload_id: &str) -> AppResult<bool> {
            self.inner.delete(upload_id).await
        }

        async fn purge_expired(&self) -> AppResult<u64> {
            self.inner.purge_expired().await
        }
    }

    fn harness() -> Harness {
        harness_with(MemoryBlobStore::new(), 1024 * 1024)
    }

    fn request(upload_id: &str, declared_size: Option<u64>) -> UploadRequest {
        UploadRequest {
            upload_id: upload_id.to_string(),
            folder_id: "root".to_string(),
            declared_size,
        }
    }

    fn text_part() -> FilePart {
        FilePart {
            file_name: "notes.txt".to_string(),
            mime_type: "text/plain".to_string(),
        }
    }

    fn chunked(count: usize, size: usize) -> impl Stream<Item = Result<Bytes, String>> {
        stream::iter((0..count).map(move |_| Ok(Bytes::from(vec![b'x'; size]))))
    }

    async fn drain<T: crate::models::EventSchema>(queue: &MemoryQueue, name: QueueName) -> Vec<T> {
        let options = PollOptions {
            max_messages: 1000,
            wait: Duration::ZERO,
            visibility_timeout: Duration::from_secs(60),
        };
        queue
            .poll(name, options)
            .await
            .unwrap()
            .iter()
            .map(|m| T::parse(&m.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_successful_upload() {
        let h = harness();
        let session = h.pipeline.start(request("u1", Some(4096)), text_part()).await.unwrap();

        let response = session.ingest(chunked(16, 256)).await.unwrap();

        assert_eq!(response.upload_id, "u1");
        assert_eq!(response.file.file_size, 4096);
        assert_eq!(response.file.folder_id, "root");
        let (data, content_type) = h.blobs.get(&response.file.storage_key).unwrap();
        assert_eq!(data.len(), 4096);
        assert_eq!(content_type, "text/plain");

        let record = h.progress.get("u1").await.unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Completed);
        assert_eq!(record.uploaded_bytes, 4096);
        assert_eq!(record.progress, 100.0);

        let events: Vec<ProgressEvent> = drain(&h.queue, QueueName::ProgressEvents).await;
        let last = events.last().unwrap();
        assert_eq!(last.event, ProgressEventKind::UploadCompleted);
        assert_eq!(last.progress, Some(100.0));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        for pair in events.windows(2) {
            assert!(pair[1].uploaded_bytes > pair[0].uploaded_bytes || pair[1].is_terminal());
        }

        let file_events: Vec<FileEvent> = drain(&h.queue, QueueName::FileEvents).await;
        assert_eq!(file_events.len(), 1);
        assert_eq!(file_events[0].event, FileEventKind::FileCreated);
        assert_eq!(file_events[0].file_id, response.file.id.to_string());
    }

    #[tokio::test]
    async fn test_unsupported_media_type_is_failed_without_blob() {
        let h = harness();
        let part = FilePart {
            file_name: "setup.exe".to_string(),
            mime_type: "application/x-msdownload".to_string(),
        };

        let result = h.pipeline.start(request("u2", None), part).await;

        assert!(matches!(result, Err(AppError::UnsupportedMediaType(_))));
        assert!(h.blobs.is_empty());
        assert!(h.files.is_empty());
        assert_eq!(
            h.progress.get("u2").await.unwrap().unwrap().status,
            UploadStatus::Failed
        );
        let events: Vec<ProgressEvent> = drain(&h.queue, QueueName::ProgressEvents).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, ProgressEventKind::UploadFailed);
    }

    #[tokio::test]
    async fn test_size_limit_aborts_upload() {
        let h = harness_with(MemoryBlobStore::new(), 1000);
        let session = h.pipeline.start(request("u3", None), text_part()).await.unwrap();

        let result = session.ingest(chunked(10, 200)).await;

        assert!(matches!(result, Err(AppError::PayloadTooLarge { max_bytes: 1000 })));
        assert!(h.blobs.is_empty());
        assert!(h.files.is_empty());
        assert_eq!(
            h.progress.get("u3").await.unwrap().unwrap().status,
            UploadStatus::Failed
        );
        let events: Vec<ProgressEvent> = drain(&h.queue, QueueName::ProgressEvents).await;
        assert_eq!(events.last().unwrap().event, ProgressEventKind::UploadFailed);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_marks_upload_failed() {
        let h = harness_with(MemoryBlobStore::failing_after(500), 1024 * 1024);
        let session = h.pipeline.start(request("u4", Some(2000)), text_part()).await.unwrap();

        let result = session.ingest(chunked(20, 100)).await;

        assert!(matches!(result, Err(AppError::UploadBackendFailure(_))));
        assert!(h.files.is_empty());
        assert_eq!(
            h.progress.get("u4").await.unwrap().unwrap().status,
            UploadStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_broken_client_stream_marks_upload_failed() {
        let h = harness();
        let session = h.pipeline.start(request("u5", None), text_part()).await.unwrap();
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err("connection reset".to_string()),
        ]);

        let result = session.ingest(source).await;

        assert!(matches!(result, Err(AppError::MalformedMultipart(_))));
        assert!(h.blobs.is_empty());
        let record = h.progress.get("u5").await.unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Failed);
        assert_eq!(record.uploaded_bytes, 3);
    }

    #[tokio::test]
    async fn test_record_failure_removes_blob() {
        let h = harness();
        h.files.set_failing(true);
        let session = h.pipeline.start(request("u6", None), text_part()).await.unwrap();

        let result = session.ingest(chunked(2, 10)).await;

        assert!(matches!(result, Err(AppError::Database(_))));
        assert!(h.blobs.is_empty());
        assert_eq!(
            h.progress.get("u6").await.unwrap().unwrap().status,
            UploadStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_progress_store_outage_does_not_fail_upload() {
        let h = harness();
        h.progress.set_failing(true);
        let session = h.pipeline.start(request("u7", Some(100)), text_part()).await.unwrap();

        let response = session.ingest(chunked(4, 25)).await.unwrap();

        assert_eq!(response.file.file_size, 100);
        let events: Vec<ProgressEvent> = drain(&h.queue, QueueName::ProgressEvents).await;
        assert_eq!(events.last().unwrap().event, ProgressEventKind::UploadCompleted);
    }

    #[tokio::test]
    async fn test_dropped_session_is_marked_failed() {
        let h = harness();
        let session = h.pipeline.start(request("u8", None), text_part()).await.unwrap();

        drop(session);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            h.progress.get("u8").await.unwrap().unwrap().status,
            UploadStatus::Failed
        );
        let events: Vec<ProgressEvent> = drain(&h.queue, QueueName::ProgressEvents).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, ProgressEventKind::UploadFailed);
    }

    #[tokio::test]
    async fn test_terminal_write_happens_once() {
        let h = harness();
        let session = h.pipeline.start(request("u9", None), text_part()).await.unwrap();
        session.ingest(chunked(3, 10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events: Vec<ProgressEvent> = drain(&h.queue, QueueName::ProgressEvents).await;
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(events.last().unwrap().status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn test_drop_during_progress_init_is_marked_failed() {
        let h = harness();
        let stalling = Arc::new(StallingProgressStore {
            inner: Arc::clone(&h.progress),
            stalled: std::sync::atomic::AtomicBool::new(false),
        });
        let pipeline = UploadPipeline::new(
            stalling,
            h.queue.clone(),
            h.blobs.clone(),
            h.files.clone(),
            h.pipeline.settings.clone(),
        );

        let started = tokio::time::timeout(
            Duration::from_millis(20),
            pipeline.start(request("u10", Some(50)), text_part()),
        )
        .await;
        assert!(started.is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            h.progress.get("u10").await.unwrap().unwrap().status,
            UploadStatus::Failed
        );
        let events: Vec<ProgressEvent> = drain(&h.queue, QueueName::ProgressEvents).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, ProgressEventKind::UploadFailed);
    }
}
