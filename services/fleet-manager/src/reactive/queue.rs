//! Job queue adapters.
//!
//! Delivery is at-least-once: a message that is neither acknowledged nor
//! rejected comes back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};

/// Settles one delivered message.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Handled; do not deliver again.
    async fn ack(&self) -> Result<()>;

    /// Deliver again later.
    async fn requeue(&self) -> Result<()>;

    /// Never deliver again.
    async fn reject(&self) -> Result<()>;
}

/// A message pulled from the queue.
pub struct Delivery {
    pub payload: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, acker: Box<dyn Acker>) -> Self {
        Self { payload, acker }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn requeue(self) -> Result<()> {
        self.acker.requeue().await
    }

    pub async fn reject(self) -> Result<()> {
        self.acker.reject().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Source of job requests.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Pull up to `max` messages. An empty batch means the queue is drained.
    async fn pull(&self, max: usize) -> Result<Vec<Delivery>>;
}

// =============================================================================
// In-Memory Queue
// =============================================================================

#[derive(Default)]
struct MemoryState {
    ready: Mutex<VecDeque<Vec<u8>>>,
    unavailable: AtomicBool,
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
}

/// Queue backed by a local deque, for development and tests.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        lock(&self.state.ready).push_back(payload.into());
    }

    pub fn push_json<T: serde::Serialize>(&self, message: &T) -> serde_json::Result<()> {
        self.push(serde_json::to_vec(message)?);
        Ok(())
    }

    /// Make every pull fail with [`FleetError::QueueUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages waiting for delivery.
    pub fn len(&self) -> usize {
        lock(&self.state.ready).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn delivered(&self) -> u64 {
        self.state.delivered.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> u64 {
        self.state.acked.load(Ordering::SeqCst)
    }

    pub fn requeued(&self) -> u64 {
        self.state.requeued.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.state.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn pull(&self, max: usize) -> Result<Vec<Delivery>> {
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(FleetError::QueueUnavailable("memory queue offline".into()));
        }
        let mut ready = lock(&self.state.ready);
        let take = max.min(ready.len());
        let batch: Vec<Delivery> = ready
            .drain(..take)
            .map(|payload| {
                let acker = MemoryAcker {
                    state: self.state.clone(),
                    payload: payload.clone(),
                };
                Delivery::new(payload, Box::new(acker))
            })
            .collect();
        self.state
            .delivered
            .fetch_add(batch.len() as u64, Ordering::SeqCst);
        Ok(batch)
    }
}

struct MemoryAcker {
    state: Arc<MemoryState>,
    payload: Vec<u8>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.state.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn requeue(&self) -> Result<()> {
        self.state.requeued.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.ready).push_back(self.payload.clone());
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.state.rejected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// NATS JetStream Queue
// =============================================================================

/// Connection settings for [`NatsQueue`].
#[derive(Debug, Clone)]
pub struct NatsQueueConfig {
    pub url: String,
    pub stream: String,
    pub subject: String,

    /// Durable consumer name.
    pub consumer: String,

    /// How long a delivered message may stay unsettled before redelivery.
    pub ack_wait: Duration,

    /// How long a pull waits for messages.
    pub fetch_wait: Duration,
}

/// Durable JetStream pull consumer.
pub struct NatsQueue {
    consumer: PullConsumer,
    fetch_wait: Duration,
}

impl NatsQueue {
    /// Connect and bind the durable consumer, creating stream and consumer
    /// if needed.
    pub async fn connect(config: &NatsQueueConfig) -> Result<Self> {
        info!(url = %config.url, stream = %config.stream, "Connecting to job queue");

        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| FleetError::QueueUnavailable(format!("connect: {e}")))?;
        let context = jetstream::new(client);

        let stream = context
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream.clone(),
                subjects: vec![config.subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|e| FleetError::QueueUnavailable(format!("stream: {e}")))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &config.consumer,
                jetstream::consumer::pull::Config {
                    durable_name: Some(config.consumer.clone()),
                    filter_subject: config.subject.clone(),
                    ack_wait: config.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| FleetError::QueueUnavailable(format!("consumer: {e}")))?;

        Ok(Self {
            consumer,
            fetch_wait: config.fetch_wait,
        })
    }
}

#[async_trait]
impl JobQueue for NatsQueue {
    async fn pull(&self, max: usize) -> Result<Vec<Delivery>> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max)
            .expires(self.fetch_wait)
            .messages()
            .await
            .map_err(|e| FleetError::QueueUnavailable(format!("fetch: {e}")))?;

        let mut deliveries = Vec::new();
        while let Some(message) = batch.next().await {
            match message {
                Ok(message) => {
                    let payload = message.payload.to_vec();
                    deliveries.push(Delivery::new(payload, Box::new(NatsAcker { message })));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to receive job message");
                    if deliveries.is_empty() {
                        return Err(FleetError::QueueUnavailable(format!("receive: {e}")));
                    }
                    break;
                }
            }
        }
        debug!(count = deliveries.len(), "Pulled job messages");
        Ok(deliveries)
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

impl NatsAcker {
    async fn settle(&self, kind: AckKind) -> Result<()> {
        self.message
            .ack_with(kind)
            .await
            .map_err(|e| FleetError::QueueUnavailable(format!("ack: {e}")))
    }
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(AckKind::Ack).await
    }

    async fn requeue(&self) -> Result<()> {
        self.settle(AckKind::Nak(None)).await
    }

    async fn reject(&self) -> Result<()> {
        self.settle(AckKind::Term).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_queue_redelivers_requeued() {
        let queue = MemoryQueue::new();
        queue.push("a");
        queue.push("b");
        queue.push("c");

        let batch = queue.pull(2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.len(), 1);

        let mut batch = batch.into_iter();
        batch.next().unwrap().requeue().await.unwrap();
        batch.next().unwrap().reject().await.unwrap();

        let payloads: Vec<Vec<u8>> = queue
            .pull(10)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.payload)
            .collect();
        assert_eq!(payloads, vec![b"c".to_vec(), b"a".to_vec()]);
        assert_eq!(queue.delivered(), 4);
        assert_eq!(queue.requeued(), 1);
        assert_eq!(queue.rejected(), 1);
    }

    #[tokio::test]
    async fn test_memory_queue_unavailable() {
        let queue = MemoryQueue::new();
        queue.push("a");
        queue.set_unavailable(true);
        assert!(matches!(
            queue.pull(1).await,
            Err(FleetError::QueueUnavailable(_))
        ));

        queue.set_unavailable(false);
        assert_eq!(queue.pull(1).await.unwrap().len(), 1);
    }
}
