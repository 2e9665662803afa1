//! SeaORM database migrations.

pub use sea_orm_migration::prelude::*;

mod m20261018_000001_create_files;
mod m20261018_000002_create_upload_progress;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261018_000001_create_files::Migration),
            Box::new(m20261018_000002_create_upload_progress::Migration),
        ]
    }
}
