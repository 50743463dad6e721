//! Durable message queue with manual acknowledgement.
//!
//! A received message is leased to its consumer until the consumer calls
//! [`MessageQueue::ack`] or [`MessageQueue::nack`]. A lease that outlives the
//! visibility timeout lapses and the message is delivered again, so delivery
//! is at-least-once. Settling under a lapsed lease fails.

use crate::db::DbHandle;
use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_QUEUE_NAME: &str = "image_processing_queue";

/// How long a consumer may hold a message before it is handed out again.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: i64,
    pub message_id: Uuid,
    pub body: Vec<u8>,
    /// Number of times this message has been handed to a consumer, this one included.
    pub delivery_count: u32,
    /// Identifies this hand-out; only its holder can settle the message.
    pub lease: Uuid,
}

impl Delivery {
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, body: Vec<u8>) -> Result<Uuid, QueueError>;

    /// Takes the next ready message, or `None` when the queue is empty.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Removes the message permanently.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Moves the message to the back of the queue for redelivery, or drops it
    /// when `requeue` is false.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;
}

/// Named queue stored in the `image_queue` table.
#[derive(Clone)]
pub struct PgQueue {
    db: DbHandle,
    name: String,
    visibility_timeout: Duration,
}

impl PgQueue {
    pub fn new(db: DbHandle, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes messages whose lease has lapsed ready again.
    ///
    /// `receive` also claims lapsed messages; this only brings them back
    /// in queue order right away, e.g. after a crash.
    pub async fn recover(&self) -> Result<u64, QueueError> {
        let recovered = self
            .db
            .release_expired_messages(&self.name, self.visibility_timeout.as_secs_f64())
            .await?;
        if recovered > 0 {
            info!(queue = %self.name, recovered, "Recovered messages with lapsed leases");
        }
        Ok(recovered)
    }
}

#[async_trait]
impl MessageQueue for PgQueue {
    async fn publish(&self, body: Vec<u8>) -> Result<Uuid, QueueError> {
        let message_id = Uuid::new_v4();
        self.db
            .enqueue_message(&self.name, message_id, &body)
            .await?;
        Ok(message_id)
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let lease = Uuid::new_v4();
        let message = self
            .db
            .claim_message(&self.name, lease, self.visibility_timeout.as_secs_f64())
            .await?;
        Ok(message.map(|m| Delivery {
            tag: m.id,
            message_id: m.message_id,
            body: m.body,
            delivery_count: u32::try_from(m.delivery_count).unwrap_or(u32::MAX),
            lease,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        match self.db.delete_message(delivery.tag, delivery.lease).await? {
            0 => Err(QueueError::UnknownDelivery(delivery.tag)),
            _ => Ok(()),
        }
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let affected = if requeue {
            self.db.requeue_message(delivery.tag, delivery.lease).await?
        } else {
            self.db.delete_message(delivery.tag, delivery.lease).await?
        };
        match affected {
            0 => Err(QueueError::UnknownDelivery(delivery.tag)),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    tag: i64,
    message_id: Uuid,
    body: Vec<u8>,
    delivery_count: u32,
    lease: Option<Uuid>,
}

#[derive(Debug, Default)]
struct MemoryState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<i64, StoredMessage>,
    next_tag: i64,
    closed: bool,
}

/// In-process queue with the same acknowledgement semantics as [`PgQueue`].
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting to be received.
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Messages received but neither acked nor nacked.
    pub async fn unacked_len(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Returns every unacknowledged message to the front of the queue, as a
    /// broker does when a consumer disconnects.
    pub async fn recover(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut recovered: Vec<_> = state
            .unacked
            .drain()
            .map(|(_, mut m)| {
                m.lease = None;
                m
            })
            .collect();
        recovered.sort_by_key(|m| std::cmp::Reverse(m.tag));
        let count = recovered.len();
        for message in recovered {
            state.ready.push_front(message);
        }
        count
    }

    /// Rejects further publishes and receives.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, body: Vec<u8>) -> Result<Uuid, QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.next_tag += 1;
        let message = StoredMessage {
            tag: state.next_tag,
            message_id: Uuid::new_v4(),
            body,
            delivery_count: 0,
            lease: None,
        };
        let message_id = message.message_id;
        state.ready.push_back(message);
        Ok(message_id)
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        let Some(mut message) = state.ready.pop_front() else {
            return Ok(None);
        };
        message.delivery_count += 1;
        let lease = Uuid::new_v4();
        message.lease = Some(lease);
        let delivery = Delivery {
            tag: message.tag,
            message_id: message.message_id,
            body: message.body.clone(),
            delivery_count: message.delivery_count,
            lease,
        };
        state.unacked.insert(message.tag, message);
        debug!(delivery_tag = delivery.tag, "Delivered message");
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.take_leased(delivery).map(|_| ())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let mut message = state.take_leased(delivery)?;
        if requeue {
            message.lease = None;
            state.ready.push_back(message);
        }
        Ok(())
    }
}

impl MemoryState {
    /// Removes the unacked message held under `delivery`'s lease.
    fn take_leased(&mut self, delivery: &Delivery) -> Result<StoredMessage, QueueError> {
        let held = self
            .unacked
            .get(&delivery.tag)
            .is_some_and(|message| message.lease == Some(delivery.lease));
        if !held {
            return Err(QueueError::UnknownDelivery(delivery.tag));
        }
        self.unacked
            .remove(&delivery.tag)
            .ok_or(QueueError::UnknownDelivery(delivery.tag))
    }
}
