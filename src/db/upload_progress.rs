//! Database queries for upload progress records.
//!
//! Writes take a row lock so the merge rules in `models::progress` see the
//! latest committed record.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QuerySelect, Set, TransactionTrait,
};

use crate::entity::upload_progress::{self, ActiveModel, Column, Entity as UploadProgressRow};
use crate::error::{AppError, AppResult};
use crate::models::progress::{ProgressUpdate, UploadProgress, UploadStatus, apply_update};
use crate::services::progress_store::ProgressStore;

use super::DbPool;

fn model_to_progress(m: upload_progress::Model) -> AppResult<UploadProgress> {
    let status = UploadStatus::parse(&m.status).ok_or_else(|| {
        AppError::Database(format!(
            "Unknown upload status '{}' for upload {}",
            m.status, m.upload_id
        ))
    })?;

    Ok(UploadProgress {
        upload_id: m.upload_id,
        file_name: m.file_name,
        file_size: m.file_size.map(|size| size.max(0) as u64),
        uploaded_bytes: m.uploaded_bytes.max(0) as u64,
        progress: m.progress,
        status,
        updated_at: m.updated_at,
        expires_at: m.expires_at,
    })
}

fn progress_to_active(record: &UploadProgress) -> ActiveModel {
    ActiveModel {
        upload_id: Set(record.upload_id.clone()),
        file_name: Set(record.file_name.clone()),
        file_size: Set(record.file_size.map(|size| size as i64)),
        uploaded_bytes: Set(record.uploaded_bytes as i64),
        progress: Set(record.progress),
        status: Set(record.status.as_str().to_string()),
        updated_at: Set(record.updated_at),
        expires_at: Set(record.expires_at),
    }
}

/// Progress store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgProgressStore {
    pool: DbPool,
    ttl: Duration,
}

impl PgProgressStore {
    pub fn new(pool: DbPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }
}

#[async_trait]
impl ProgressStore for PgProgressStore {
    async fn upsert(&self, update: &ProgressUpdate) -> AppResult<UploadProgress> {
        let now = Utc::now();
        let txn = self
            .pool
            .connection()
            .begin()
            .await
            .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;

        // A record that expired but was not swept yet is treated as absent.
        let existing = UploadProgressRow::find_by_id(update.upload_id.clone())
            .filter(Column::ExpiresAt.gt(now))
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(|e| AppError::Database(format!("Failed to load upload progress: {}", e)))?
            .map(model_to_progress)
            .transpose()?;

        let Some(record) = apply_update(existing.as_ref(), update, now, self.ttl) else {
            txn.commit().await?;
            // apply_update only refuses to write over an existing terminal record
            return existing.ok_or_else(|| {
                AppError::Database("Terminal upload progress vanished".to_string())
            });
        };

        let active = progress_to_active(&record);
        if existing.is_some() {
            active.update(&txn).await.map_err(|e| {
                AppError::Database(format!("Failed to update upload progress: {}", e))
            })?;
        } else {
            UploadProgressRow::insert(active)
                .on_conflict(
                    OnConflict::column(Column::UploadId)
                        .update_columns([
                            Column::FileName,
                            Column::FileSize,
                            Column::UploadedBytes,
                            Column::Progress,
                            Column::Status,
                            Column::UpdatedAt,
                            Column::ExpiresAt,
                        ])
                        .to_owned(),
                )
                .exec_without_returning(&txn)
                .await
                .map_err(|e| {
                    AppError::Database(format!("Failed to insert upload progress: {}", e))
                })?;
        }

        txn.commit().await?;
        Ok(record)
    }

    async fn get(&self, upload_id: &str) -> AppResult<Option<UploadProgress>> {
        UploadProgressRow::find_by_id(upload_id.to_string())
            .filter(Column::ExpiresAt.gt(Utc::now()))
            .one(self.pool.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get upload progress: {}", e)))?
            .map(model_to_progress)
            .transpose()
    }

    async fn delete(&self, upload_id: &str) -> AppResult<bool> {
        let result = UploadProgressRow::delete_by_id(upload_id.to_string())
            .exec(self.pool.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to delete upload progress: {}", e)))?;

        Ok(result.rows_affected > 0)
    }

    async fn purge_expired(&self) -> AppResult<u64> {
        let result = UploadProgressRow::delete_many()
            .filter(Column::ExpiresAt.lte(Utc::now()))
            .exec(self.pool.connection())
            .await
            .map_err(|e| {
                AppError::Database(format!("Failed to purge expired upload progress: {}", e))
            })?;

        Ok(result.rows_affected)
    }
}
