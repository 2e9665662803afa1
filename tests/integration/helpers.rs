//! Shared helpers for the integration tests.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, dev::ServiceResponse, test, web};
use bytes::Bytes;
use nsm_storage_lib::api;
use nsm_storage_lib::config::{SseMode, SseSettings, UploadSettings};
use nsm_storage_lib::models::ProgressEvent;
use nsm_storage_lib::services::queue::{PollOptions, in_process_queues};
use nsm_storage_lib::services::{
    EventStreams, FileService, MemoryBlobStore, MemoryFileRepository, MemoryProgressStore,
    MemoryQueue, MessageQueue, ProgressEventHandler, QueueConsumer, QueueName,
    SubscriberRegistry, UploadPipeline,
};
use serde_json::Value;

pub const BOUNDARY: &str = "----nsm-test-boundary";

/// In-memory backends shared by one test app.
pub struct Backends {
    pub progress: Arc<MemoryProgressStore>,
    pub queue: Arc<MemoryQueue>,
    pub blobs: Arc<MemoryBlobStore>,
    pub files: Arc<MemoryFileRepository>,
    pub registry: SubscriberRegistry,
}

impl Backends {
    pub fn new() -> Self {
        Self::with_queue(MemoryQueue::new())
    }

    /// Backends whose queue keeps what `main` keeps for `sse` without SQS.
    pub fn for_settings(sse: &SseSettings) -> Self {
        Self::with_queue(MemoryQueue::with_queues(in_process_queues(sse)))
    }

    pub fn with_queue(queue: MemoryQueue) -> Self {
        Self {
            progress: Arc::new(MemoryProgressStore::new(Duration::from_secs(3600))),
            queue: Arc::new(queue),
            blobs: Arc::new(MemoryBlobStore::new()),
            files: Arc::new(MemoryFileRepository::new()),
            registry: SubscriberRegistry::with_buffer(4096),
        }
    }

    /// Deliver everything on the progress queue to SSE subscribers.
    pub async fn pump_progress(&self) -> usize {
        let consumer = QueueConsumer::new(
            self.queue.clone(),
            QueueName::ProgressEvents,
            ProgressEventHandler::new(self.registry.clone()),
        )
        .with_options(instant_poll());

        let mut total = 0;
        loop {
            let acked = consumer.poll_once().await.expect("memory queue poll");
            if acked == 0 {
                return total;
            }
            total += acked;
        }
    }

    /// Drain a queue and return the parsed message bodies in order.
    pub async fn drain(&self, queue: QueueName) -> Vec<Value> {
        let mut bodies = Vec::new();
        loop {
            let batch = self.queue.poll(queue, instant_poll()).await.unwrap();
            if batch.is_empty() {
                return bodies;
            }
            for message in batch {
                bodies.push(serde_json::from_str(&message.body).unwrap());
                self.queue.ack(queue, &message.receipt_handle).await.unwrap();
            }
        }
    }

    /// Drain the progress queue as typed events.
    pub async fn progress_events(&self) -> Vec<ProgressEvent> {
        self.drain(QueueName::ProgressEvents)
            .await
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect()
    }
}

pub fn instant_poll() -> PollOptions {
    PollOptions {
        max_messages: 10,
        wait: Duration::ZERO,
        visibility_timeout: Duration::from_secs(60),
    }
}

pub fn upload_settings(max_upload_size: u64) -> UploadSettings {
    UploadSettings {
        max_upload_size,
        progress_throttle: Duration::ZERO,
        progress_ttl: Duration::from_secs(3600),
    }
}

pub fn sse_settings(mode: SseMode) -> SseSettings {
    SseSettings {
        mode,
        progress_consumer_enabled: mode == SseMode::Queue,
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_secs(10),
        max_wait: Duration::from_secs(15),
    }
}

/// Create a test app over `backends`.
pub async fn create_test_app(
    backends: &Backends,
    upload: UploadSettings,
    sse: SseSettings,
) -> impl actix_web::dev::Service<
    actix_http::Request,
    Response = ServiceResponse,
    Error = actix_web::Error,
> {
    let pipeline = UploadPipeline::new(
        backends.progress.clone(),
        backends.queue.clone(),
        backends.blobs.clone(),
        backends.files.clone(),
        upload,
    );
    let streams = EventStreams::new(backends.registry.clone(), backends.progress.clone(), sse);
    let file_service = FileService::new(
        backends.files.clone(),
        backends.blobs.clone(),
        backends.queue.clone(),
    );

    test::init_service(
        App::new()
            .app_data(web::Data::new(pipeline))
            .app_data(web::Data::new(streams))
            .app_data(web::Data::new(file_service))
            .service(
                web::scope("/api/v1")
                    .configure(api::configure_health_routes)
                    .configure(api::configure_upload_routes)
                    .configure(api::configure_event_routes)
                    .configure(api::configure_file_routes),
            ),
    )
    .await
}

/// A multipart part.
pub enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        name: &'a str,
        mime_type: &'a str,
        data: &'a [u8],
    },
}

pub fn multipart_body(parts: &[Part<'_>]) -> Bytes {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File {
                name,
                mime_type,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        name, mime_type
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    Bytes::from(body)
}

pub fn upload_request(parts: &[Part<'_>]) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/api/v1/upload")
        .insert_header((
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        ))
        .set_payload(multipart_body(parts))
}

/// Send a request and return status and JSON body.
pub async fn call_json<S>(app: &S, req: actix_http::Request) -> (u16, Value)
where
    S: actix_web::dev::Service<
            actix_http::Request,
            Response = ServiceResponse,
            Error = actix_web::Error,
        >,
{
    let resp = test::call_service(app, req).await;
    let status = resp.status().as_u16();
    let body: Value = test::read_body_json(resp).await;
    (status, body)
}

/// Split an SSE body into `(event name, data)` pairs.
pub fn parse_frames(body: &[u8]) -> Vec<(Option<String>, Value)> {
    let text = String::from_utf8_lossy(body);
    text.split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .map(|frame| {
            let mut event = None;
            let mut data = Value::Null;
            for line in frame.lines() {
                if let Some(name) = line.strip_prefix("event: ") {
                    event = Some(name.to_string());
                } else if let Some(json) = line.strip_prefix("data: ") {
                    data = serde_json::from_str(json).unwrap();
                }
            }
            (event, data)
        })
        .collect()
}
