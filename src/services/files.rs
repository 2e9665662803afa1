//! File metadata lookups and deletion.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::events::now_millis;
use crate::models::{FileEvent, FileEventKind, FileRecord};
use crate::services::best_effort::best_effort;
use crate::services::blob_store::BlobStore;
use crate::services::file_repository::FileRepository;
use crate::services::queue::{MessageQueue, QueueName};

#[derive(Clone)]
pub struct FileService {
    files: Arc<dyn FileRepository>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn MessageQueue>,
}

impl FileService {
    pub fn new(
        files: Arc<dyn FileRepository>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            files,
            blobs,
            queue,
        }
    }

    pub async fn get(&self, id: Uuid) -> AppResult<FileRecord> {
        self.files
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("File {}", id)))
    }

    /// Delete the record, then its blob, and publish `FILE_DELETED`.
    ///
    /// A blob that cannot be removed is logged and left behind; the record is
    /// already gone at that point.
    pub async fn delete(&self, id: Uuid) -> AppResult<FileRecord> {
        let record = self
            .files
            .delete(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("File {}", id)))?;

        let file_id = record.id.to_string();
        best_effort("Blob delete", &file_id, self.blobs.delete(&record.storage_key)).await;

        let event = FileEvent {
            event: FileEventKind::FileDeleted,
            file_id: file_id.clone(),
            folder_id: Some(record.folder_id.clone()),
            name: Some(record.name.clone()),
            mime_type: Some(record.mime_type.clone()),
            file_size: Some(record.file_size),
            at: Some(now_millis()),
        };
        let body = serde_json::to_string(&event)?;
        best_effort(
            "Event publish",
            &file_id,
            self.queue.publish(QueueName::FileEvents, &body),
        )
        .await;

        info!(file_id = %file_id, "File deleted");
        Ok(record)
    }
}
