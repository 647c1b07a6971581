use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{task_key, Envelope, QueueError, TaskQueue, QUEUE_KEY};

/// Redis-backed queue: a list for FIFO order and `SETEX` keys for the mirror.
///
/// Blocking pops run on their own connection so a pending `BRPOP` never
/// delays enqueues or health checks issued through the shared one.
pub struct RedisTaskQueue {
    commands: RwLock<Option<ConnectionManager>>,
    blocking: RwLock<Option<ConnectionManager>>,
    ttl_secs: u64,
}

impl RedisTaskQueue {
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self, QueueError> {
        let client = Client::open(redis_url)?;
        let commands = client.get_connection_manager().await?;
        let blocking = client.get_connection_manager().await?;
        info!("Connected to redis queue");

        Ok(Self {
            commands: RwLock::new(Some(commands)),
            blocking: RwLock::new(Some(blocking)),
            ttl_secs: ttl.as_secs().max(1),
        })
    }

    async fn commands(&self) -> Result<ConnectionManager, QueueError> {
        self.commands.read().await.clone().ok_or(QueueError::Disconnected)
    }

    async fn blocking(&self) -> Result<ConnectionManager, QueueError> {
        self.blocking.read().await.clone().ok_or(QueueError::Disconnected)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let mut conn = self.commands().await?;
        let payload = serde_json::to_string(envelope)?;

        let _: () = redis::pipe()
            .atomic()
            .lpush(QUEUE_KEY, &payload)
            .ignore()
            .set_ex(task_key(&envelope.task_id), &payload, self.ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!("Enqueued task {} ({})", envelope.task_id, envelope.task_type);
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Envelope>, QueueError> {
        let mut conn = self.blocking().await?;

        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(QUEUE_KEY)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        match popped {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn queue_length(&self) -> usize {
        let Ok(mut conn) = self.commands().await else {
            return 0;
        };
        let len: RedisResult<usize> = conn.llen(QUEUE_KEY).await;
        len.unwrap_or_else(|e| {
            warn!("Failed to read queue length: {}", e);
            0
        })
    }

    async fn delete_envelope(&self, task_id: &str) {
        let mut conn = match self.commands().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Cannot delete cache entry for task {}: {}", task_id, e);
                return;
            }
        };
        let result: RedisResult<()> = conn.del(task_key(task_id)).await;
        if let Err(e) = result {
            warn!("Failed to delete cache entry for task {}: {}", task_id, e);
        }
    }

    async fn is_healthy(&self) -> bool {
        let Ok(mut conn) = self.commands().await else {
            return false;
        };
        let pong: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    async fn disconnect(&self) {
        self.commands.write().await.take();
        self.blocking.write().await.take();
        info!("Disconnected from redis queue");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_URL: &str = "redis://127.0.0.1:6379";

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn round_trip_preserves_envelope() {
        let queue = RedisTaskQueue::connect(TEST_URL, Duration::from_secs(60)).await.unwrap();
        let envelope = Envelope::new(uuid::Uuid::new_v4().to_string(), "caption");

        queue.enqueue(&envelope).await.unwrap();
        let popped = queue.dequeue(Duration::from_secs(1)).await.unwrap();
        assert_eq!(popped, Some(envelope.clone()));

        let mut conn = queue.commands().await.unwrap();
        let ttl: i64 = conn.ttl(task_key(&envelope.task_id)).await.unwrap();
        assert!(ttl > 0 && ttl <= 60);

        queue.delete_envelope(&envelope.task_id).await;
        let exists: bool = conn.exists(task_key(&envelope.task_id)).await.unwrap();
        assert!(!exists);
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn disconnected_queue_degrades() {
        let queue = RedisTaskQueue::connect(TEST_URL, Duration::from_secs(60)).await.unwrap();
        queue.disconnect().await;

        assert_eq!(queue.queue_length().await, 0);
        assert!(!queue.is_healthy().await);
        assert!(matches!(queue.dequeue(Duration::from_millis(10)).await, Err(QueueError::Disconnected)));
    }
}
