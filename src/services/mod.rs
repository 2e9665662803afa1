//! Business logic services.

pub mod best_effort;
pub mod blob_store;
pub mod cleanup;
pub mod consumer;
pub mod file_repository;
pub mod files;
pub mod memory;
pub mod progress_store;
pub mod queue;
pub mod sse;
pub mod throttle;
pub mod upload;

pub use blob_store::{BlobStore, MemoryBlobStore, S3BlobStore};
pub use cleanup::{CleanupConfig, start_cleanup_task};
pub use consumer::{LifecycleEventHandler, ProgressEventHandler, QueueConsumer};
pub use file_repository::FileRepository;
pub use files::FileService;
pub use memory::{MemoryFileRepository, MemoryProgressStore};
pub use progress_store::ProgressStore;
pub use queue::{MemoryQueue, MessageQueue, QueueName, SqsQueue};
pub use sse::{EventStreams, SubscriberRegistry};
pub use throttle::Throttle;
pub use upload::{FilePart, UploadPipeline, UploadRequest, UploadSession};
