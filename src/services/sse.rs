//! Server-Sent Events for upload progress.
//!
//! `SubscriberRegistry` fans progress events out to the open streams of each
//! upload. `EventStreams` builds the response body of one stream, fed either
//! by the registry (queue mode) or by polling the progress store (poll mode).

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::{SseMode, SseSettings};
use crate::models::events::now_millis;
use crate::models::{ProgressEvent, UploadProgress, UploadStatus};
use crate::services::best_effort::best_effort;
use crate::services::progress_store::ProgressStore;

/// Frames buffered per connection before new frames are dropped for it.
const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

/// Response body stream of one SSE connection.
pub type FrameStream = BoxStream<'static, Result<Bytes, Infallible>>;

// ============================================================================
// Framing
// ============================================================================

/// Unnamed `data:` frame.
pub fn data_frame<T: Serialize>(payload: &T) -> Bytes {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {}\n\n", json))
}

/// Named frame, `event: <name>` followed by a `data:` line.
pub fn named_frame<T: Serialize>(event: &str, payload: &T) -> Bytes {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("event: {}\ndata: {}\n\n", event, json))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PendingPayload<'a> {
    upload_id: &'a str,
    status: UploadStatus,
    progress: f64,
}

/// First frame of every stream.
pub fn connected_frame(upload_id: &str) -> Bytes {
    named_frame(
        "connected",
        &PendingPayload {
            upload_id,
            status: UploadStatus::Uploading,
            progress: 0.0,
        },
    )
}

/// Sent once by poll mode when no record showed up in time.
pub fn timeout_frame(upload_id: &str) -> Bytes {
    named_frame(
        "timeout",
        &PendingPayload {
            upload_id,
            status: UploadStatus::Uploading,
            progress: 0.0,
        },
    )
}

pub fn ping_frame() -> Bytes {
    named_frame("ping", &serde_json::json!({ "t": now_millis() }))
}

// ============================================================================
// Subscriber registry
// ============================================================================

type Connections = HashMap<String, HashMap<u64, mpsc::Sender<Bytes>>>;

struct RegistryInner {
    connections: Mutex<Connections>,
    next_id: AtomicU64,
    buffer: usize,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, Connections> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, upload_id: &str, connection_id: u64) {
        let mut connections = self.lock();
        if let Some(entry) = connections.get_mut(upload_id) {
            entry.remove(&connection_id);
            if entry.is_empty() {
                connections.remove(upload_id);
            }
        }
    }
}

/// Process-wide map of upload id to open event streams.
#[derive(Clone)]
pub struct SubscriberRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// Registry whose connections buffer at most `buffer` frames.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: Mutex::default(),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Register a connection for `upload_id`.
    ///
    /// Frames for the connection arrive on the returned receiver, which ends
    /// after a terminal event.
    pub fn subscribe(&self, upload_id: &str) -> (Subscription, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let connection_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .lock()
            .entry(upload_id.to_string())
            .or_default()
            .insert(connection_id, tx);

        debug!(upload_id = %upload_id, connection_id, "SSE subscriber registered");

        let subscription = Subscription {
            registry: Arc::downgrade(&self.inner),
            upload_id: upload_id.to_string(),
            connection_id,
            active: true,
        };
        (subscription, rx)
    }

    /// Deliver `event` to every connection of `upload_id`.
    ///
    /// Returns the number of connections that accepted the frame. A terminal
    /// event closes and removes every connection of the upload; a connection
    /// with a full buffer still gets the terminal frame once it catches up.
    pub fn emit(&self, upload_id: &str, event: &ProgressEvent) -> usize {
        let frame = data_frame(event);
        let terminal = event.is_terminal();
        let mut delivered = 0;

        let mut connections = self.inner.lock();
        let Some(entry) = connections.get_mut(upload_id) else {
            return 0;
        };

        entry.retain(|connection_id, tx| match tx.try_send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                !terminal
            }
            // A terminal frame must still arrive: hand it to a task that waits
            // for buffer space, then drops the last sender to close the stream.
            Err(TrySendError::Full(frame)) if terminal => {
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let tx = tx.clone();
                        handle.spawn(async move {
                            let _ = tx.send(frame).await;
                        });
                        delivered += 1;
                    }
                    Err(_) => warn!(
                        upload_id = %upload_id,
                        connection_id = *connection_id,
                        "Terminal frame dropped, no runtime to deliver it"
                    ),
                }
                false
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    upload_id = %upload_id,
                    connection_id = *connection_id,
                    "SSE subscriber is not keeping up, frame dropped"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if entry.is_empty() {
            connections.remove(upload_id);
        }

        delivered
    }

    /// Open connections for `upload_id`.
    pub fn subscriber_count(&self, upload_id: &str) -> usize {
        self.inner.lock().get(upload_id).map_or(0, HashMap::len)
    }

    /// Uploads with at least one open connection.
    pub fn upload_count(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for one registered connection; unregisters on drop.
pub struct Subscription {
    registry: Weak<RegistryInner>,
    upload_id: String,
    connection_id: u64,
    active: bool,
}

impl Subscription {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Remove the connection from the registry. Calling it again does nothing.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.upload_id, self.connection_id);
            debug!(
                upload_id = %self.upload_id,
                connection_id = self.connection_id,
                "SSE subscriber removed"
            );
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ============================================================================
// Streams
// ============================================================================

fn heartbeat(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

struct QueueStreamState {
    rx: mpsc::Receiver<Bytes>,
    heartbeat: Interval,
    _subscription: Subscription,
}

/// What the poll stream last sent, to skip unchanged records.
#[derive(PartialEq)]
struct Snapshot {
    status: UploadStatus,
    uploaded_bytes: u64,
    file_size: Option<u64>,
}

impl From<&UploadProgress> for Snapshot {
    fn from(record: &UploadProgress) -> Self {
        Self {
            status: record.status,
            uploaded_bytes: record.uploaded_bytes,
            file_size: record.file_size,
        }
    }
}

struct PollStreamState {
    store: Arc<dyn ProgressStore>,
    upload_id: String,
    poll: Interval,
    heartbeat: Interval,
    started: Instant,
    max_wait: Duration,
    last_sent: Option<Snapshot>,
    timeout_sent: bool,
    finished: bool,
}

enum PollStep {
    Emit(Bytes),
    Idle,
    End,
}

impl PollStreamState {
    async fn poll_once(&mut self) -> PollStep {
        let record = match self.store.get(&self.upload_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(upload_id = %self.upload_id, "Progress lookup failed, closing stream: {}", e);
                return PollStep::End;
            }
        };

        let Some(record) = record else {
            if !self.timeout_sent && self.started.elapsed() >= self.max_wait {
                self.timeout_sent = true;
                return PollStep::Emit(timeout_frame(&self.upload_id));
            }
            return PollStep::Idle;
        };

        let snapshot = Snapshot::from(&record);
        if self.last_sent.as_ref() == Some(&snapshot) {
            return PollStep::Idle;
        }
        self.last_sent = Some(snapshot);

        let frame = data_frame(&ProgressEvent::from_record(&record));
        if record.status.is_terminal() {
            best_effort(
                "Progress cleanup",
                &self.upload_id,
                self.store.delete(&self.upload_id),
            )
            .await;
            self.finished = true;
        }
        PollStep::Emit(frame)
    }
}

/// Builds the frame stream of one SSE connection.
#[derive(Clone)]
pub struct EventStreams {
    registry: SubscriberRegistry,
    progress: Arc<dyn ProgressStore>,
    settings: SseSettings,
}

impl EventStreams {
    pub fn new(
        registry: SubscriberRegistry,
        progress: Arc<dyn ProgressStore>,
        settings: SseSettings,
    ) -> Self {
        Self {
            registry,
            progress,
            settings,
        }
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn mode(&self) -> SseMode {
        self.settings.mode
    }

    /// Open a stream for `upload_id`. Dropping the stream releases its
    /// subscription and timers.
    pub fn open(&self, upload_id: &str) -> FrameStream {
        let connected = connected_frame(upload_id);
        let first = stream::iter([Ok::<_, Infallible>(connected)]);

        match self.settings.mode {
            SseMode::Queue => first.chain(self.queue_stream(upload_id)).boxed(),
            SseMode::Poll => first.chain(self.poll_stream(upload_id)).boxed(),
        }
    }

    fn queue_stream(&self, upload_id: &str) -> FrameStream {
        let (subscription, rx) = self.registry.subscribe(upload_id);
        let state = QueueStreamState {
            rx,
            heartbeat: heartbeat(self.settings.heartbeat_interval),
            _subscription: subscription,
        };

        stream::unfold(state, |mut state| async move {
            tokio::select! {
                biased;
                frame = state.rx.recv() => frame.map(|frame| (Ok(frame), state)),
                _ = state.heartbeat.tick() => Some((Ok(ping_frame()), state)),
            }
        })
        .boxed()
    }

    fn poll_stream(&self, upload_id: &str) -> FrameStream {
        let mut poll = tokio::time::interval_at(
            Instant::now() + self.settings.poll_interval,
            self.settings.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let state = PollStreamState {
            store: Arc::clone(&self.progress),
            upload_id: upload_id.to_string(),
            poll,
            heartbeat: heartbeat(self.settings.heartbeat_interval),
            started: Instant::now(),
            max_wait: self.settings.max_wait,
            last_sent: None,
            timeout_sent: false,
            finished: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if state.finished {
                    return None;
                }
                tokio::select! {
                    biased;
                    _ = state.poll.tick() => match state.poll_once().await {
                        PollStep::Emit(frame) => return Some((Ok(frame), state)),
                        PollStep::Idle => continue,
                        PollStep::End => return None,
                    },
                    _ = state.heartbeat.tick() => return Some((Ok(ping_frame()), state)),
                }
            }
        })
        .boxed()
    }
}
