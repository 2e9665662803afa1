//! Database queries for file metadata.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, EntityTrait, ModelTrait, Set};
use uuid::Uuid;

use crate::entity::file::{self, ActiveModel, Entity as File};
use crate::error::{AppError, AppResult};
use crate::models::{FileRecord, NewFile};
use crate::services::file_repository::FileRepository;

use super::DbPool;

fn model_to_record(m: file::Model) -> FileRecord {
    FileRecord {
        id: m.id,
        name: m.name,
        original_name: m.original_name,
        storage_key: m.storage_key,
        public_url: m.public_url,
        file_size: m.file_size.max(0) as u64,
        mime_type: m.mime_type,
        folder_id: m.folder_id,
        created_at: m.created_at,
        updated_at: m.updated_at,
    }
}

#[async_trait]
impl FileRepository for DbPool {
    async fn create(&self, new_file: NewFile) -> AppResult<FileRecord> {
        let now = Utc::now();
        let model = ActiveModel {
            id: Set(Uuid::now_v7()),
            name: Set(new_file.name),
            original_name: Set(new_file.original_name),
            storage_key: Set(new_file.storage_key),
            public_url: Set(new_file.public_url),
            file_size: Set(new_file.file_size as i64),
            mime_type: Set(new_file.mime_type),
            folder_id: Set(new_file.folder_id),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let inserted = model
            .insert(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to insert file: {}", e)))?;

        Ok(model_to_record(inserted))
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<FileRecord>> {
        let result = File::find_by_id(id)
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get file: {}", e)))?;

        Ok(result.map(model_to_record))
    }

    async fn delete(&self, id: Uuid) -> AppResult<Option<FileRecord>> {
        let Some(model) = File::find_by_id(id)
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get file: {}", e)))?
        else {
            return Ok(None);
        };

        let record = model_to_record(model.clone());
        model
            .delete(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to delete file: {}", e)))?;

        Ok(Some(record))
    }
}
