//! File metadata repository interface.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{FileRecord, NewFile};

#[async_trait]
pub trait FileRepository: Send + Sync {
    async fn create(&self, new_file: NewFile) -> AppResult<FileRecord>;

    async fn get(&self, id: Uuid) -> AppResult<Option<FileRecord>>;

    /// Delete the record, returning it when it existed.
    async fn delete(&self, id: Uuid) -> AppResult<Option<FileRecord>>;
}
