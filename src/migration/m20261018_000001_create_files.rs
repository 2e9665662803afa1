//! Migration: Create files table.
//!
//! Metadata for uploaded files; payloads live in the blob store.

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
                CREATE OR REPLACE FUNCTION update_updated_at_column()
                RETURNS TRIGGER AS $$
                BEGIN
                    NEW.updated_at = NOW();
                    RETURN NEW;
                END;
                $$ LANGUAGE plpgsql;

                CREATE TABLE files (
                    id UUID PRIMARY KEY, -- UUIDv7 for time-ordered sorting

                    name VARCHAR(500) NOT NULL,
                    original_name VARCHAR(500) NOT NULL,
                    storage_key VARCHAR(1024) NOT NULL,   -- object key in the blob store
                    public_url TEXT NOT NULL,
                    file_size BIGINT NOT NULL CHECK (file_size >= 0),
                    mime_type VARCHAR(255) NOT NULL,
                    folder_id VARCHAR(64) NOT NULL DEFAULT 'root',

                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                );

                CREATE UNIQUE INDEX idx_files_storage_key ON files(storage_key);
                CREATE INDEX idx_files_folder_id ON files(folder_id);
                CREATE INDEX idx_files_name ON files(name);

                CREATE TRIGGER update_files_updated_at
                    BEFORE UPDATE ON files
                    FOR EACH ROW
                    EXECUTE FUNCTION update_updated_at_column();
                "#,
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared(
                r#"
                DROP TRIGGER IF EXISTS update_files_updated_at ON files;
                DROP TABLE IF EXISTS files CASCADE;
                DROP FUNCTION IF EXISTS update_updated_at_column();
                "#,
            )
            .await?;

        Ok(())
    }
}
