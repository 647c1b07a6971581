use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod redis_queue;

pub use self::memory::MemoryTaskQueue;
pub use self::redis_queue::RedisTaskQueue;

pub const QUEUE_KEY: &str = "media:queue";
pub const TASK_KEY_PREFIX: &str = "media:task:";

pub fn task_key(task_id: &str) -> String {
    format!("{}{}", TASK_KEY_PREFIX, task_id)
}

/// What travels through the queue. The record store holds everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub task_id: String,
    pub task_type: String,
}

impl Envelope {
    pub fn new(task_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue is disconnected")]
    Disconnected,
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// FIFO of task envelopes plus a keyed mirror that expires after the
/// retention window.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Push to the tail and write the mirror, both or neither.
    async fn enqueue(&self, envelope: &Envelope) -> Result<(), QueueError>;

    /// Pop from the head, waiting at most `timeout`. `Ok(None)` on timeout.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Envelope>, QueueError>;

    /// Current depth; 0 when disconnected or on error.
    async fn queue_length(&self) -> usize;

    /// Best-effort removal of the mirror entry.
    async fn delete_envelope(&self, task_id: &str);

    async fn is_healthy(&self) -> bool;

    async fn disconnect(&self);
}

/// `memory://` selects the in-process queue, anything else is a redis URL.
pub async fn connect(url: &str, ttl: Duration) -> Result<Arc<dyn TaskQueue>, QueueError> {
    if url.starts_with(crate::config::MEMORY_QUEUE_URL) {
        return Ok(Arc::new(MemoryTaskQueue::new(ttl)));
    }
    Ok(Arc::new(RedisTaskQueue::connect(url, ttl).await?))
}
