//! File metadata models and upload DTOs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Folder identifier used when the client does not name one.
pub const ROOT_FOLDER_ID: &str = "root";

/// MIME types accepted by the upload endpoint.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    // Images
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/bmp",
    "image/webp",
    "image/tiff",
    // Documents
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "text/plain",
    "text/csv",
    // Video
    "video/mp4",
];

/// Check a MIME type against the allow-list, ignoring parameters such as `charset`.
pub fn is_allowed_mime_type(mime_type: &str) -> bool {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    ALLOWED_MIME_TYPES.contains(&essence.as_str())
}

/// Stored file metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// File name as sent by the client
    pub original_name: String,
    /// Object key in the blob store
    pub storage_key: String,
    pub public_url: String,
    pub file_size: u64,
    pub mime_type: String,
    pub folder_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Data needed to create a file record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFile {
    pub name: String,
    pub original_name: String,
    pub storage_key: String,
    pub public_url: String,
    pub file_size: u64,
    pub mime_type: String,
    pub folder_id: String,
}

/// Response body of a successful upload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub upload_id: String,
    pub file: FileRecord,
}

/// Response body of a file deletion.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeleteFileResponse {
    pub status: bool,
    pub id: Uuid,
}
