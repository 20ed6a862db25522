use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::models::job::{ErrorDetail, JobId};
use crate::services::job_store::{JobStore, JobStoreError};

const QUEUE_KEY: &str = "crop_queue:tasks";
const PROCESSING_KEY_PREFIX: &str = "crop_queue:processing:";

/// Task payload serialized onto the broker.
///
/// Carries the stored upload's location, never the image bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub job_id: JobId,
    pub source_path: String,
    pub filename: String,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskMessage {
    /// Build a message with a freshly assigned job id.
    pub fn new(source_path: impl Into<String>, filename: impl Into<String>) -> Self {
        Self::with_job_id(JobId::new(), source_path, filename)
    }

    pub fn with_job_id(
        job_id: JobId,
        source_path: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            source_path: source_path.into(),
            filename: filename.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// A message handed to one consumer, held until acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: TaskMessage,
    receipt: String,
}

impl Delivery {
    pub fn job_id(&self) -> JobId {
        self.message.job_id
    }
}

/// Message transport between producers and workers.
///
/// Brokers move opaque payloads; job semantics live in `TaskQueue`.
/// Popped payloads are parked in the consumer's in-flight set until acked,
/// so a consumer that dies mid-task can `recover` them on restart.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn push(&self, payload: String) -> Result<(), QueueError>;

    /// Pop one payload, waiting up to `wait` for one to arrive.
    async fn pop(&self, consumer: &str, wait: Duration) -> Result<Option<String>, QueueError>;

    async fn ack(&self, consumer: &str, payload: &str) -> Result<(), QueueError>;

    /// Return the consumer's unacknowledged payloads to the queue.
    async fn recover(&self, consumer: &str) -> Result<usize, QueueError>;

    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis list broker: LPUSH to enqueue, BRPOPLPUSH into a per-consumer
/// processing list, LREM to acknowledge.
pub struct RedisBroker {
    client: redis::Client,
}

impl RedisBroker {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Transport)?;
        Ok(Self { client })
    }

    fn processing_key(consumer: &str) -> String {
        format!("{PROCESSING_KEY_PREFIX}{consumer}")
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, payload: String) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload).await?;
        Ok(())
    }

    async fn pop(&self, consumer: &str, wait: Duration) -> Result<Option<String>, QueueError> {
        // Blocking commands stall a multiplexed connection, so each pop gets its own.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(QUEUE_KEY)
            .arg(Self::processing_key(consumer))
            .arg(wait.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(payload)
    }

    async fn ack(&self, consumer: &str, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.lrem::<_, _, ()>(Self::processing_key(consumer), 1, payload)
            .await?;
        Ok(())
    }

    async fn recover(&self, consumer: &str) -> Result<usize, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let processing = Self::processing_key(consumer);
        let mut recovered = 0;
        loop {
            // Back onto the popping end so recovered tasks run next.
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&processing)
                .arg(QUEUE_KEY)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                return Ok(recovered);
            }
            recovered += 1;
        }
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-process broker for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryBroker {
    lists: Mutex<MemoryLists>,
    available: Notify,
}

#[derive(Default)]
struct MemoryLists {
    ready: VecDeque<String>,
    in_flight: HashMap<String, Vec<String>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of delivered but unacknowledged payloads across all consumers.
    pub async fn in_flight(&self) -> usize {
        self.lists.lock().await.in_flight.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, payload: String) -> Result<(), QueueError> {
        self.lists.lock().await.ready.push_back(payload);
        self.available.notify_one();
        Ok(())
    }

    async fn pop(&self, consumer: &str, wait: Duration) -> Result<Option<String>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            {
                // Pop and park under one lock so a cancelled pop never loses a payload.
                let mut lists = self.lists.lock().await;
                if let Some(payload) = lists.ready.pop_front() {
                    lists
                        .in_flight
                        .entry(consumer.to_string())
                        .or_default()
                        .push(payload.clone());
                    return Ok(Some(payload));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, self.available.notified()).await;
        }
    }

    async fn ack(&self, consumer: &str, payload: &str) -> Result<(), QueueError> {
        let mut lists = self.lists.lock().await;
        if let Some(held) = lists.in_flight.get_mut(consumer) {
            if let Some(pos) = held.iter().position(|p| p == payload) {
                held.remove(pos);
            }
        }
        Ok(())
    }

    async fn recover(&self, consumer: &str) -> Result<usize, QueueError> {
        let mut lists = self.lists.lock().await;
        let held = lists.in_flight.remove(consumer).unwrap_or_default();
        let recovered = held.len();
        for payload in held.into_iter().rev() {
            lists.ready.push_front(payload);
        }
        drop(lists);

        for _ in 0..recovered {
            self.available.notify_one();
        }
        Ok(recovered)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.lists.lock().await.ready.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Task queue client shared by the submission service and the workers.
///
/// Enqueueing registers the job as PENDING before the message becomes
/// visible to workers.
#[derive(Clone)]
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
    store: Arc<dyn JobStore>,
}

impl TaskQueue {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn JobStore>) -> Self {
        Self { broker, store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Enqueue a crop job and return its identifier.
    pub async fn enqueue(&self, message: &TaskMessage) -> Result<JobId, QueueError> {
        let job_id = message.job_id;
        let payload = serde_json::to_string(message)?;

        self.store.create(job_id).await?;

        if let Err(e) = self.broker.push(payload).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to publish task, failing job");
            let detail = ErrorDetail::new("transport", e.to_string());
            if let Err(store_err) = self.store.set_failure(job_id, detail).await {
                tracing::error!(job_id = %job_id, error = %store_err, "Failed to record publish failure");
            }
            return Err(e);
        }

        tracing::info!(job_id = %job_id, source = %message.source_path, "Enqueued crop job");
        Ok(job_id)
    }

    /// Wait up to `wait` for the next task.
    ///
    /// Payloads that cannot be decoded are acknowledged and reported as
    /// `Malformed` so they are not redelivered forever.
    pub async fn dequeue(
        &self,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let Some(payload) = self.broker.pop(consumer, wait).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<TaskMessage>(&payload) {
            Ok(message) => Ok(Some(Delivery {
                message,
                receipt: payload,
            })),
            Err(e) => {
                self.broker.ack(consumer, &payload).await?;
                Err(QueueError::Malformed(e))
            }
        }
    }

    /// Mark a delivery as fully handled.
    pub async fn ack(&self, consumer: &str, delivery: &Delivery) -> Result<(), QueueError> {
        self.broker.ack(consumer, &delivery.receipt).await
    }

    /// Requeue everything `consumer` received but never acknowledged.
    pub async fn recover(&self, consumer: &str) -> Result<usize, QueueError> {
        self.broker.recover(consumer).await
    }

    pub async fn depth(&self) -> Result<u64, QueueError> {
        self.broker.depth().await
    }

    pub async fn health_check(&self) -> Result<(), QueueError> {
        self.broker.health_check().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Malformed task payload: {0}")]
    Malformed(serde_json::Error),

    #[error("Job store error: {0}")]
    Store(#[from] JobStoreError),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Transport(_) => true,
            QueueError::Store(e) => e.is_transient(),
            QueueError::Serialize(_) | QueueError::Malformed(_) => false,
        }
    }
}
