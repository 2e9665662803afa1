//! Progress store interface.
//!
//! Implementations apply `models::progress::apply_update`, so every backend
//! shares the same rules: one record per upload id, terminal records are
//! never rewritten and `uploaded_bytes` never decreases.

use async_trait::async_trait;

use crate::error::AppResult;
use crate::models::{ProgressUpdate, UploadProgress};

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Merge `update` into the record, creating it if needed.
    ///
    /// Returns the record as stored afterwards. A write against a terminal
    /// record is a no-op returning that record.
    async fn upsert(&self, update: &ProgressUpdate) -> AppResult<UploadProgress>;

    /// Current record, `None` when absent or expired.
    async fn get(&self, upload_id: &str) -> AppResult<Option<UploadProgress>>;

    /// Remove the record. Returns whether one existed.
    async fn delete(&self, upload_id: &str) -> AppResult<bool>;

    /// Remove every record past its expiry. Returns the number removed.
    async fn purge_expired(&self) -> AppResult<u64>;
}
