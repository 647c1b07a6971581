use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::{Envelope, QueueError, TaskQueue};

#[derive(Default)]
struct State {
    queue: VecDeque<Envelope>,
    mirror: HashMap<String, (Envelope, Instant)>,
}

/// In-process queue with the same contract as the redis one.
pub struct MemoryTaskQueue {
    state: Mutex<State>,
    notify: Notify,
    connected: AtomicBool,
    ttl: Duration,
}

impl MemoryTaskQueue {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            connected: AtomicBool::new(true),
            ttl,
        }
    }

    fn check_connected(&self) -> Result<(), QueueError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Disconnected)
        }
    }

    /// The mirrored envelope for `task_id`, unless it expired or was deleted.
    pub async fn cached(&self, task_id: &str) -> Option<Envelope> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.mirror.retain(|_, (_, expires_at)| *expires_at > now);
        state.mirror.get(task_id).map(|(envelope, _)| envelope.clone())
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, envelope: &Envelope) -> Result<(), QueueError> {
        self.check_connected()?;
        {
            let mut state = self.state.lock().await;
            state.queue.push_back(envelope.clone());
            state
                .mirror
                .insert(envelope.task_id.clone(), (envelope.clone(), Instant::now() + self.ttl));
        }
        self.notify.notify_one();
        debug!("Enqueued task {} ({})", envelope.task_id, envelope.task_type);
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Envelope>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_connected()?;
            if let Some(envelope) = self.state.lock().await.queue.pop_front() {
                return Ok(Some(envelope));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn queue_length(&self) -> usize {
        if self.check_connected().is_err() {
            return 0;
        }
        self.state.lock().await.queue.len()
    }

    async fn delete_envelope(&self, task_id: &str) {
        self.state.lock().await.mirror.remove(task_id);
    }

    async fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // wake blocked consumers so they observe the disconnect
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> MemoryTaskQueue {
        MemoryTaskQueue::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_round_trips() {
        let queue = queue();
        let envelope = Envelope::new("abc123", "caption");
        queue.enqueue(&envelope).await.unwrap();

        assert_eq!(queue.dequeue(Duration::from_millis(10)).await.unwrap(), Some(envelope));
    }

    #[tokio::test]
    async fn preserves_fifo_order() {
        let queue = queue();
        for id in ["a", "b", "c"] {
            queue.enqueue(&Envelope::new(id, "merge")).await.unwrap();
        }
        assert_eq!(queue.queue_length().await, 3);

        let mut order = Vec::new();
        while let Some(envelope) = queue.dequeue(Duration::from_millis(10)).await.unwrap() {
            order.push(envelope.task_id);
        }
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn dequeue_times_out_with_none() {
        let started = Instant::now();
        assert_eq!(queue().dequeue(Duration::from_millis(50)).await.unwrap(), None);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn blocked_dequeue_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(queue());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(&Envelope::new("late", "caption")).await.unwrap();

        let popped = consumer.await.unwrap().unwrap();
        assert_eq!(popped.map(|e| e.task_id), Some("late".to_string()));
    }

    #[tokio::test]
    async fn mirror_expires_after_ttl() {
        let queue = MemoryTaskQueue::new(Duration::from_millis(30));
        queue.enqueue(&Envelope::new("t1", "caption")).await.unwrap();
        assert!(queue.cached("t1").await.is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.cached("t1").await.is_none());
    }

    #[tokio::test]
    async fn disconnected_queue_degrades() {
        let queue = queue();
        queue.enqueue(&Envelope::new("t1", "caption")).await.unwrap();
        queue.disconnect().await;

        assert_eq!(queue.queue_length().await, 0);
        assert!(!queue.is_healthy().await);
        assert!(matches!(
            queue.enqueue(&Envelope::new("t2", "caption")).await,
            Err(QueueError::Disconnected)
        ));
        assert!(matches!(queue.dequeue(Duration::from_millis(10)).await, Err(QueueError::Disconnected)));
    }
}
