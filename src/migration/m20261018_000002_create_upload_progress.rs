//! Migration: Create upload_progress table.
//!
//! One row per upload id, rewritten while bytes stream in and purged after
//! `expires_at` by the cleanup task.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared(
                r#"
                CREATE TABLE upload_progress (
                    upload_id VARCHAR(255) PRIMARY KEY,   -- client-chosen identifier

                    file_name VARCHAR(500),
                    file_size BIGINT CHECK (file_size >= 0),
                    uploaded_bytes BIGINT NOT NULL DEFAULT 0 CHECK (uploaded_bytes >= 0),
                    progress DOUBLE PRECISION NOT NULL DEFAULT 0
                        CHECK (progress >= 0 AND progress <= 100),
                    status VARCHAR(20) NOT NULL DEFAULT 'uploading'
                        CHECK (status IN ('uploading', 'completed', 'failed')),

                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    expires_at TIMESTAMPTZ NOT NULL
                );

                -- TTL sweep
                CREATE INDEX idx_upload_progress_expires_at ON upload_progress(expires_at);
                CREATE INDEX idx_upload_progress_status ON upload_progress(status);
                "#,
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("DROP TABLE IF EXISTS upload_progress CASCADE;")
            .await?;

        Ok(())
    }
}
