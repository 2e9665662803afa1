//! In-process metadata stores.
//!
//! Used by tests and by single-instance development runs. Both follow the
//! same contracts as their PostgreSQL counterparts in `db`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::progress::apply_update;
use crate::models::{FileRecord, NewFile, ProgressUpdate, UploadProgress};
use crate::services::file_repository::FileRepository;
use crate::services::progress_store::ProgressStore;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Progress store held in a map.
pub struct MemoryProgressStore {
    records: Mutex<HashMap<String, UploadProgress>>,
    ttl: Duration,
    failing: AtomicBool,
}

impl MemoryProgressStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Mutex::default(),
            ttl,
            failing: AtomicBool::new(false),
        }
    }

    /// Make every operation fail until reset, to exercise error handling.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of stored records, expired ones included.
    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> AppResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Database("progress store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn upsert(&self, update: &ProgressUpdate) -> AppResult<UploadProgress> {
        self.check_available()?;
        let now = Utc::now();
        let mut records = lock(&self.records);

        let existing = records
            .get(&update.upload_id)
            .filter(|record| !record.is_expired(now));

        match apply_update(existing, update, now, self.ttl) {
            Some(record) => {
                records.insert(record.upload_id.clone(), record.clone());
                Ok(record)
            }
            None => existing.cloned().ok_or_else(|| {
                AppError::Database("Terminal upload progress vanished".to_string())
            }),
        }
    }

    async fn get(&self, upload_id: &str) -> AppResult<Option<UploadProgress>> {
        self.check_available()?;
        let now = Utc::now();
        Ok(lock(&self.records)
            .get(upload_id)
            .filter(|record| !record.is_expired(now))
            .cloned())
    }

    async fn delete(&self, upload_id: &str) -> AppResult<bool> {
        self.check_available()?;
        Ok(lock(&self.records).remove(upload_id).is_some())
    }

    async fn purge_expired(&self) -> AppResult<u64> {
        self.check_available()?;
        let now = Utc::now();
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}

/// File repository held in a map.
#[derive(Default)]
pub struct MemoryFileRepository {
    files: Mutex<HashMap<Uuid, FileRecord>>,
    failing: AtomicBool,
}

impl MemoryFileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create` fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.files).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<FileRecord> {
        lock(&self.files).values().cloned().collect()
    }
}

#[async_trait]
impl FileRepository for MemoryFileRepository {
    async fn create(&self, new_file: NewFile) -> AppResult<FileRecord> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Database("file repository unavailable".to_string()));
        }

        let now = Utc::now();
        let record = FileRecord {
            id: Uuid::now_v7(),
            name: new_file.name,
            original_name: new_file.original_name,
            storage_key: new_file.storage_key,
            public_url: new_file.public_url,
            file_size: new_file.file_size,
            mime_type: new_file.mime_type,
            folder_id: new_file.folder_id,
            created_at: now,
            updated_at: now,
        };
        lock(&self.files).insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<FileRecord>> {
        Ok(lock(&self.files).get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> AppResult<Option<FileRecord>> {
        Ok(lock(&self.files).remove(&id))
    }
}
