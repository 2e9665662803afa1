//! SeaORM entity definitions for PostgreSQL database.

pub mod file;
pub mod upload_progress;
