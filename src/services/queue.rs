//! Message queue client.
//!
//! At-least-once delivery with visibility timeouts and explicit
//! acknowledgement. `SqsQueue` talks to AWS SQS (or ElasticMQ/LocalStack);
//! `MemoryQueue` keeps the same semantics in-process for single-instance
//! deployments and tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::config::{Credentials, Region};
use aws_sdk_sqs::error::DisplayErrorContext;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{SqsConfig, SseSettings};
use crate::error::AppError;

/// Logical queues used by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    ProgressEvents,
    FileEvents,
    FolderEvents,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [Self::ProgressEvents, Self::FileEvents, Self::FolderEvents];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProgressEvents => "progress-events",
            Self::FileEvents => "file-events",
            Self::FolderEvents => "folder-events",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Long-poll parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub max_messages: usize,
    pub wait: Duration,
    pub visibility_timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

/// A message handed out by `poll`, invisible to other pollers until acked or
/// its visibility timeout lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue `{0}` is not configured")]
    NotConfigured(QueueName),
    #[error("unknown receipt handle for queue `{0}`")]
    UnknownReceipt(QueueName),
    #[error("queue transport error: {0}")]
    Transport(String),
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        AppError::Queue(err.to_string())
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a JSON body.
    async fn publish(&self, queue: QueueName, body: &str) -> Result<(), QueueError>;

    /// Long-poll for up to `options.max_messages` messages.
    async fn poll(
        &self,
        queue: QueueName,
        options: PollOptions,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Acknowledge (delete) a received message.
    async fn ack(&self, queue: QueueName, receipt_handle: &str) -> Result<(), QueueError>;

    /// Whether `queue` can be polled.
    fn is_configured(&self, queue: QueueName) -> bool;
}

// ============================================================================
// SQS
// ============================================================================

/// AWS SQS backed queue client.
#[derive(Clone)]
pub struct SqsQueue {
    client: Client,
    urls: HashMap<QueueName, String>,
}

impl SqsQueue {
    /// Create a new SQS client from configuration.
    ///
    /// Static credentials are used when both keys are set; otherwise the
    /// default AWS credential chain applies.
    pub async fn new(config: &SqsConfig) -> Self {
        let region = Region::new(config.region.clone());

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => aws_sdk_sqs::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .region(region)
                .credentials_provider(Credentials::new(
                    access_key, secret_key, None, None, "nsm",
                )),
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_sqs::config::Builder::from(&shared)
            }
        };

        // ElasticMQ/LocalStack in development
        if let Some(ref endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let mut urls = HashMap::new();
        for (name, url) in [
            (QueueName::ProgressEvents, &config.progress_events_url),
            (QueueName::FileEvents, &config.file_events_url),
            (QueueName::FolderEvents, &config.folder_events_url),
        ] {
            if let Some(url) = url {
                urls.insert(name, url.clone());
            }
        }

        info!(
            "SQS client initialized: region={}, queues={:?}",
            config.region,
            urls.keys().map(QueueName::as_str).collect::<Vec<_>>()
        );

        Self {
            client: Client::from_conf(builder.build()),
            urls,
        }
    }

    fn url(&self, queue: QueueName) -> Result<&str, QueueError> {
        self.urls
            .get(&queue)
            .map(String::as_str)
            .ok_or(QueueError::NotConfigured(queue))
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn publish(&self, queue: QueueName, body: &str) -> Result<(), QueueError> {
        // Publishing is optional per queue; consumers of unconfigured queues never start.
        let Some(url) = self.urls.get(&queue) else {
            debug!(queue = %queue, "Queue not configured, event dropped");
            return Ok(());
        };

        self.client
            .send_message()
            .queue_url(url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| QueueError::Transport(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    async fn poll(
        &self,
        queue: QueueName,
        options: PollOptions,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let url = self.url(queue)?;

        let output = self
            .client
            .receive_message()
            .queue_url(url)
            .max_number_of_messages(options.max_messages.min(10) as i32)
            .wait_time_seconds(options.wait.as_secs().min(20) as i32)
            .visibility_timeout(options.visibility_timeout.as_secs() as i32)
            .send()
            .await
            .map_err(|e| QueueError::Transport(DisplayErrorContext(&e).to_string()))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|m| {
                Some(ReceivedMessage {
                    message_id: m.message_id().unwrap_or_default().to_string(),
                    receipt_handle: m.receipt_handle()?.to_string(),
                    body: m.body().unwrap_or("{}").to_string(),
                })
            })
            .collect();

        Ok(messages)
    }

    async fn ack(&self, queue: QueueName, receipt_handle: &str) -> Result<(), QueueError> {
        let url = self.url(queue)?;

        self.client
            .delete_message()
            .queue_url(url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Transport(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    fn is_configured(&self, queue: QueueName) -> bool {
        self.urls.contains_key(&queue)
    }
}

// ============================================================================
// In-process queue
// ============================================================================

struct StoredMessage {
    message_id: String,
    body: String,
    receipt_handle: Option<String>,
    invisible_until: Option<Instant>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.is_none_or(|until| until <= now)
    }
}

/// Queues the in-process queue keeps when it stands in for SQS.
///
/// Progress events are only kept when this process runs the progress
/// consumer; nothing else would ever drain them.
pub fn in_process_queues(sse: &SseSettings) -> Vec<QueueName> {
    QueueName::ALL
        .into_iter()
        .filter(|queue| *queue != QueueName::ProgressEvents || sse.progress_consumer_enabled)
        .collect()
}

/// In-process queue with visibility timeouts and long polling.
pub struct MemoryQueue {
    queues: Mutex<HashMap<QueueName, VecDeque<StoredMessage>>>,
    enabled: HashSet<QueueName>,
    notify: Notify,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_queues(QueueName::ALL)
    }
}

impl MemoryQueue {
    /// Queue accepting every `QueueName`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue accepting only `queues`. Publishing elsewhere is a no-op, like an
    /// `SqsQueue` without that queue URL.
    pub fn with_queues(queues: impl IntoIterator<Item = QueueName>) -> Self {
        Self {
            queues: Mutex::default(),
            enabled: queues.into_iter().collect(),
            notify: Notify::new(),
        }
    }

    /// Messages not yet acknowledged, visible or in flight.
    pub fn len(&self, queue: QueueName) -> usize {
        self.lock().get(&queue).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self, queue: QueueName) -> bool {
        self.len(queue) == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<QueueName, VecDeque<StoredMessage>>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim visible messages, or report when the next in-flight one reappears.
    fn claim(
        &self,
        queue: QueueName,
        options: PollOptions,
        now: Instant,
    ) -> (Vec<ReceivedMessage>, Option<Instant>) {
        let mut queues = self.lock();
        let Some(messages) = queues.get_mut(&queue) else {
            return (Vec::new(), None);
        };

        let mut claimed = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for message in messages.iter_mut() {
            if claimed.len() >= options.max_messages {
                break;
            }
            if message.is_visible(now) {
                let receipt = uuid::Uuid::new_v4().to_string();
                message.receipt_handle = Some(receipt.clone());
                message.invisible_until = Some(now + options.visibility_timeout);
                claimed.push(ReceivedMessage {
                    message_id: message.message_id.clone(),
                    receipt_handle: receipt,
                    body: message.body.clone(),
                });
            } else if let Some(until) = message.invisible_until {
                next_visible = Some(next_visible.map_or(until, |n| n.min(until)));
            }
        }

        (claimed, next_visible)
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, queue: QueueName, body: &str) -> Result<(), QueueError> {
        if !self.enabled.contains(&queue) {
            debug!(queue = %queue, "Queue not enabled, event not kept");
            return Ok(());
        }
        self.lock().entry(queue).or_default().push_back(StoredMessage {
            message_id: uuid::Uuid::now_v7().to_string(),
            body: body.to_string(),
            receipt_handle: None,
            invisible_until: None,
        });
        self.notify.notify_waiters();
        Ok(())
    }

    async fn poll(
        &self,
        queue: QueueName,
        options: PollOptions,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + options.wait;

        loop {
            // Register interest before scanning so a publish in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (claimed, next_visible) = self.claim(queue, options, now);
            if !claimed.is_empty() || now >= deadline {
                return Ok(claimed);
            }

            let wake_at = next_visible.map_or(deadline, |n| n.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, queue: QueueName, receipt_handle: &str) -> Result<(), QueueError> {
        let mut queues = self.lock();
        let messages = queues
            .get_mut(&queue)
            .ok_or(QueueError::UnknownReceipt(queue))?;
        let index = messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or(QueueError::UnknownReceipt(queue))?;
        messages.remove(index);
        Ok(())
    }

    fn is_configured(&self, queue: QueueName) -> bool {
        self.enabled.contains(&queue)
    }
}
