/*!
 * Topic-routed message publication for downstream workers.
 *
 * Messages carry an exchange, a routing key, and a priority (0-10, higher
 * is more urgent). Delivery is at-least-once; consumers are expected to
 * dedup. The in-memory implementation honors priority ordering and is what
 * the test suites consume.
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

#[derive(Error, Debug)]
pub enum MessageQueueError {
    #[error("Queue is full")]
    QueueFull,
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Message envelope published to an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub exchange: String,
    pub routing_key: String,
    pub payload: serde_json::Value,
    pub priority: u8,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Message {
    pub fn new(exchange: &str, routing_key: &str, payload: serde_json::Value) -> Self {
        Self::with_priority(exchange, routing_key, payload, DEFAULT_PRIORITY)
    }

    pub fn with_priority(
        exchange: &str,
        routing_key: &str,
        payload: serde_json::Value,
        priority: u8,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            priority: priority.min(MAX_PRIORITY),
            timestamp: chrono::Utc::now(),
            retry_count: 0,
            max_retries: 3,
        }
    }

    /// Queue key used by the in-memory broker: one queue per binding.
    pub fn topic(&self) -> String {
        format!("{}/{}", self.exchange, self.routing_key)
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError>;
    /// Pop the highest-priority pending message for a binding, if any.
    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError>;
    async fn ack(&self, message_id: &Uuid) -> Result<(), MessageQueueError>;
    async fn nack(&self, message_id: &Uuid) -> Result<(), MessageQueueError>;
}

/// In-memory broker. Pop order is priority-descending, FIFO within a
/// priority level, matching an AMQP priority queue with `x-max-priority`.
#[derive(Debug, Default)]
pub struct InMemoryMessageQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<Message>>>>,
    max_size: usize,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::with_max_size(1000)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            max_size,
        }
    }

    /// Drain every pending message for a binding, in delivery order.
    /// Convenience for tests and batch consumers.
    pub fn drain_topic(&self, topic: &str) -> Vec<Message> {
        let mut queues = self.queues.lock().unwrap();
        let Some(queue) = queues.get_mut(topic) else {
            return Vec::new();
        };
        let mut drained: Vec<Message> = queue.drain(..).collect();
        drained.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.timestamp.cmp(&b.timestamp)));
        drained
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError> {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(message.topic()).or_default();
        if queue.len() >= self.max_size {
            return Err(MessageQueueError::QueueFull);
        }
        queue.push_back(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError> {
        let mut queues = self.queues.lock().unwrap();
        let Some(queue) = queues.get_mut(topic) else {
            return Ok(None);
        };
        let best = queue
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| {
                a.priority
                    .cmp(&b.priority)
                    // FIFO among equal priorities: prefer the earlier index.
                    .then(ib.cmp(ia))
            })
            .map(|(i, _)| i);
        Ok(best.and_then(|i| queue.remove(i)))
    }

    async fn ack(&self, _message_id: &Uuid) -> Result<(), MessageQueueError> {
        Ok(())
    }

    async fn nack(&self, _message_id: &Uuid) -> Result<(), MessageQueueError> {
        Ok(())
    }
}
