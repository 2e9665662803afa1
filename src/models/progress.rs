//! Upload progress record and the merge rules every progress store applies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Upload lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(Self::Uploading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted progress of one upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub upload_id: String,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub uploaded_bytes: u64,
    /// Percentage in 0..=100
    pub progress: f64,
    pub status: UploadStatus,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadProgress {
    /// Whether the record outlived its TTL at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A write against the progress record of one upload.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub upload_id: String,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub uploaded_bytes: u64,
    pub status: UploadStatus,
}

impl ProgressUpdate {
    pub fn uploading(upload_id: impl Into<String>, uploaded_bytes: u64) -> Self {
        Self {
            upload_id: upload_id.into(),
            file_name: None,
            file_size: None,
            uploaded_bytes,
            status: UploadStatus::Uploading,
        }
    }

    pub fn with_file(mut self, file_name: Option<String>, file_size: Option<u64>) -> Self {
        self.file_name = file_name;
        self.file_size = file_size;
        self
    }

    pub fn with_status(mut self, status: UploadStatus) -> Self {
        self.status = status;
        self
    }
}

/// Percentage complete, `0` when the total is unknown or zero.
pub fn compute_progress(uploaded_bytes: u64, file_size: Option<u64>) -> f64 {
    match file_size {
        Some(total) if total > 0 => (uploaded_bytes as f64 / total as f64 * 100.0).min(100.0),
        _ => 0.0,
    }
}

/// Merge `update` into the `existing` record.
///
/// Returns `None` when the existing record is terminal: terminal records are
/// never rewritten. Otherwise returns the record to persist, with
/// `uploaded_bytes` never lower than before and `updated_at`/`expires_at`
/// refreshed.
pub fn apply_update(
    existing: Option<&UploadProgress>,
    update: &ProgressUpdate,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Option<UploadProgress> {
    if existing.is_some_and(|record| record.status.is_terminal()) {
        return None;
    }

    let uploaded_bytes = existing
        .map(|record| record.uploaded_bytes.max(update.uploaded_bytes))
        .unwrap_or(update.uploaded_bytes);
    let file_size = update
        .file_size
        .or_else(|| existing.and_then(|record| record.file_size));
    let file_name = update
        .file_name
        .clone()
        .or_else(|| existing.and_then(|record| record.file_name.clone()));

    let progress = if update.status == UploadStatus::Completed {
        100.0
    } else {
        compute_progress(uploaded_bytes, file_size)
    };

    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));

    Some(UploadProgress {
        upload_id: update.upload_id.clone(),
        file_name,
        file_size,
        uploaded_bytes,
        progress,
        status: update.status,
        updated_at: now,
        expires_at: now + ttl,
    })
}
