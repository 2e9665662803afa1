//! Domain models for the storage server.

pub mod events;
pub mod file;
pub mod progress;

// Re-export commonly used types
pub use events::{
    EventSchema, EventValidationError, FileEvent, FileEventKind, FolderEvent, FolderEventKind,
    ProgressEvent, ProgressEventKind,
};
pub use file::{DeleteFileResponse, FileRecord, NewFile, ROOT_FOLDER_ID, UploadResponse};
pub use progress::{ProgressUpdate, UploadProgress, UploadStatus};
