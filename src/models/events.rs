//! Queue and stream event payloads.
//!
//! All events are JSON with camelCase keys and an `at` timestamp in epoch
//! milliseconds. Deserialization rejects unknown event kinds; `validate()`
//! enforces the per-kind field rules serde cannot express.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::progress::{UploadProgress, UploadStatus};

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Schema violation found while validating a decoded event.
#[derive(Debug, thiserror::Error, PartialEq)]
#[error("invalid {kind} event: {reason}")]
pub struct EventValidationError {
    pub kind: &'static str,
    pub reason: String,
}

impl EventValidationError {
    fn new(kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// An event type that can be decoded from a queue message and checked.
pub trait EventSchema: DeserializeOwned + Send {
    /// Short name used in logs.
    const NAME: &'static str;

    fn validate(&self) -> Result<(), EventValidationError>;

    /// Decode and validate in one step.
    fn parse(body: &str) -> Result<Self, EventValidationError> {
        let event: Self = serde_json::from_str(body)
            .map_err(|e| EventValidationError::new(Self::NAME, e.to_string()))?;
        event.validate()?;
        Ok(event)
    }
}

// ============================================================================
// Progress events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressEventKind {
    UploadProgress,
    UploadCompleted,
    UploadFailed,
}

impl ProgressEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::UploadCompleted | Self::UploadFailed)
    }
}

/// Progress of one upload, published to the progress queue and streamed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub event: ProgressEventKind,
    pub upload_id: String,
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<i64>,
}

impl ProgressEvent {
    /// Build an event from a persisted progress record.
    ///
    /// The event kind follows the record status.
    pub fn from_record(record: &UploadProgress) -> Self {
        let event = match record.status {
            UploadStatus::Uploading => ProgressEventKind::UploadProgress,
            UploadStatus::Completed => ProgressEventKind::UploadCompleted,
            UploadStatus::Failed => ProgressEventKind::UploadFailed,
        };

        Self {
            event,
            upload_id: record.upload_id.clone(),
            status: record.status,
            progress: Some(record.progress),
            uploaded_bytes: Some(record.uploaded_bytes),
            file_size: record.file_size,
            file_name: record.file_name.clone(),
            at: Some(now_millis()),
        }
    }

    /// A terminal event closes every stream that receives it.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal() || self.event.is_terminal()
    }
}

impl EventSchema for ProgressEvent {
    const NAME: &'static str = "progress";

    fn validate(&self) -> Result<(), EventValidationError> {
        if self.upload_id.is_empty() {
            return Err(EventValidationError::new(Self::NAME, "uploadId is empty"));
        }
        if let Some(progress) = self.progress
            && !(0.0..=100.0).contains(&progress)
        {
            return Err(EventValidationError::new(
                Self::NAME,
                format!("progress {} outside 0..=100", progress),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// File events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileEventKind {
    FileCreated,
    FileDeleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEvent {
    pub event: FileEventKind,
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<i64>,
}

impl EventSchema for FileEvent {
    const NAME: &'static str = "file";

    fn validate(&self) -> Result<(), EventValidationError> {
        if self.file_id.is_empty() {
            return Err(EventValidationError::new(Self::NAME, "fileId is empty"));
        }
        Ok(())
    }
}

// ============================================================================
// Folder events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FolderEventKind {
    FolderCreated,
    FolderUpdated,
    FolderDeleted,
    FolderTreeDeleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderEvent {
    pub event: FolderEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_folder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_folder_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<i64>,
}

impl EventSchema for FolderEvent {
    const NAME: &'static str = "folder";

    fn validate(&self) -> Result<(), EventValidationError> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());

        match self.event {
            FolderEventKind::FolderCreated
            | FolderEventKind::FolderUpdated
            | FolderEventKind::FolderDeleted
                if !present(&self.folder_id) =>
            {
                Err(EventValidationError::new(Self::NAME, "folderId is required"))
            }
            FolderEventKind::FolderTreeDeleted if !present(&self.root_folder_id) => Err(
                EventValidationError::new(Self::NAME, "rootFolderId is required"),
            ),
            _ => Ok(()),
        }
    }
}
