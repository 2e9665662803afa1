//! UploadProgress entity for SeaORM.
//!
//! Keyed by the client-chosen upload id; expires after `expires_at`.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "upload_progress")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub upload_id: String,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub uploaded_bytes: i64,
    pub progress: f64,
    pub status: String,
    pub updated_at: DateTimeUtc,
    pub expires_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
