//! Queue consumers.
//!
//! A `QueueConsumer` long-polls one queue and hands each message body to an
//! `EventHandler`. Handled messages are acknowledged; messages the handler
//! rejects stay in flight so the queue's redelivery and dead-letter policy
//! decides what happens next.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{EventSchema, EventValidationError, ProgressEvent};
use crate::services::queue::{MessageQueue, PollOptions, QueueName, ReceivedMessage};
use crate::services::sse::SubscriberRegistry;

/// Pause after a failed poll.
pub const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// What a handler did with a message. Both outcomes acknowledge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    /// Not meant for this consumer
    Discarded,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, body: &str) -> Result<Disposition, EventValidationError>;
}

/// Forwards progress events to the SSE subscriber registry.
#[derive(Clone)]
pub struct ProgressEventHandler {
    registry: SubscriberRegistry,
}

impl ProgressEventHandler {
    pub fn new(registry: SubscriberRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler for ProgressEventHandler {
    async fn handle(&self, body: &str) -> Result<Disposition, EventValidationError> {
        let value: serde_json::Value =
            serde_json::from_str(body).map_err(|e| EventValidationError {
                kind: ProgressEvent::NAME,
                reason: e.to_string(),
            })?;

        let has_upload_id = value
            .get("uploadId")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|id| !id.is_empty());
        if !has_upload_id {
            return Ok(Disposition::Discarded);
        }

        let event: ProgressEvent =
            serde_json::from_value(value).map_err(|e| EventValidationError {
                kind: ProgressEvent::NAME,
                reason: e.to_string(),
            })?;
        event.validate()?;

        let delivered = self.registry.emit(&event.upload_id, &event);
        debug!(
            upload_id = %event.upload_id,
            event = ?event.event,
            delivered,
            "Progress event fanned out"
        );

        Ok(Disposition::Handled)
    }
}

/// Validates and logs file or folder lifecycle events.
pub struct LifecycleEventHandler<E> {
    _event: PhantomData<fn() -> E>,
}

impl<E> LifecycleEventHandler<E> {
    pub fn new() -> Self {
        Self {
            _event: PhantomData,
        }
    }
}

impl<E> Default for LifecycleEventHandler<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E> EventHandler for LifecycleEventHandler<E>
where
    E: EventSchema + std::fmt::Debug + 'static,
{
    async fn handle(&self, body: &str) -> Result<Disposition, EventValidationError> {
        let event = E::parse(body)?;
        info!(target: "events", kind = E::NAME, "Lifecycle event: {:?}", event);
        Ok(Disposition::Handled)
    }
}

/// Long-poll loop over one queue.
pub struct QueueConsumer<H> {
    queue: Arc<dyn MessageQueue>,
    queue_name: QueueName,
    handler: H,
    options: PollOptions,
    backoff: Duration,
}

impl<H: EventHandler + 'static> QueueConsumer<H> {
    pub fn new(queue: Arc<dyn MessageQueue>, queue_name: QueueName, handler: H) -> Self {
        Self {
            queue,
            queue_name,
            handler,
            options: PollOptions::default(),
            backoff: POLL_ERROR_BACKOFF,
        }
    }

    pub fn with_options(mut self, options: PollOptions) -> Self {
        self.options = options;
        self
    }

    /// Poll once and process the batch. Returns the number of acknowledged messages.
    pub async fn poll_once(&self) -> Result<usize, crate::services::queue::QueueError> {
        let messages = self.queue.poll(self.queue_name, self.options).await?;
        Ok(self.process(messages).await)
    }

    async fn process(&self, messages: Vec<ReceivedMessage>) -> usize {
        let mut acked = 0;

        for message in messages {
            match self.handler.handle(&message.body).await {
                Ok(disposition) => {
                    if disposition == Disposition::Discarded {
                        debug!(
                            queue = %self.queue_name,
                            message_id = %message.message_id,
                            "Message without uploadId discarded"
                        );
                    }
                    match self
                        .queue
                        .ack(self.queue_name, &message.receipt_handle)
                        .await
                    {
                        Ok(()) => acked += 1,
                        Err(e) => warn!(
                            queue = %self.queue_name,
                            message_id = %message.message_id,
                            "Failed to acknowledge message: {}",
                            e
                        ),
                    }
                }
                Err(e) => warn!(
                    queue = %self.queue_name,
                    message_id = %message.message_id,
                    "Message rejected, left for redelivery: {}",
                    e
                ),
            }
        }

        acked
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.queue_name, "Queue consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                polled = self.queue.poll(self.queue_name, self.options) => polled,
            };

            match polled {
                Ok(messages) => {
                    self.process(messages).await;
                }
                Err(e) => {
                    warn!(queue = %self.queue_name, "Queue poll failed: {}", e);
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }

        info!(queue = %self.queue_name, "Queue consumer stopped");
    }

    /// Spawn `run` on the tokio runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
