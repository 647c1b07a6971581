use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::TaskManager;
use crate::queue::Envelope;
use crate::schedule::types::TaskType;

/// Cooperative stop signal shared by the dispatcher, the sweeper and `main`.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is set.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    // size of the concurrency gate
    pub max_workers: usize,
    // bounded wait of each blocking dequeue
    pub dequeue_timeout: Duration,
    // pause after a failed dequeue
    pub error_backoff: Duration,
    // grace period for in-flight tasks on shutdown
    pub drain_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            dequeue_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

const HEARTBEAT_EVERY: u64 = 20;

/// Bridges the queue and the executors.
///
/// The loop never waits for a task: each one is spawned and blocks on the
/// gate itself, so at most `max_workers` run at once. Every spawned executor
/// is tracked from the moment of dispatch, before it asks for a slot.
pub struct TaskDispatcher {
    task_manager: Arc<TaskManager>,
    gate: Arc<Semaphore>,
    executors: TaskTracker,
    config: DispatcherConfig,
}

impl TaskDispatcher {
    pub fn new(task_manager: Arc<TaskManager>, config: DispatcherConfig) -> Self {
        let config = DispatcherConfig {
            max_workers: config.max_workers.max(1),
            ..config
        };
        Self {
            gate: Arc::new(Semaphore::new(config.max_workers)),
            executors: TaskTracker::new(),
            task_manager,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Slots currently held by running executors.
    pub fn busy_slots(&self) -> usize {
        self.config.max_workers - self.gate.available_permits()
    }

    /// Executors dispatched and not yet finished, including those still
    /// waiting for a slot.
    pub fn in_flight(&self) -> usize {
        self.executors.len()
    }

    pub async fn run(&self, shutdown: ShutdownFlag) {
        info!("Dispatcher started with {} worker slots", self.config.max_workers);
        let queue = self.task_manager.queue().clone();
        let mut loops: u64 = 0;

        while !shutdown.is_triggered() {
            loops += 1;
            if loops % HEARTBEAT_EVERY == 0 {
                info!(
                    "Dispatcher alive, queue length {}, busy slots {}",
                    queue.queue_length().await,
                    self.busy_slots()
                );
            }

            match queue.dequeue(self.config.dequeue_timeout).await {
                Ok(Some(envelope)) => self.dispatch(envelope).await,
                Ok(None) => continue,
                Err(e) => {
                    error!("Dequeue failed: {}", e);
                    tokio::select! {
                        _ = sleep(self.config.error_backoff) => {}
                        _ = shutdown.wait() => {}
                    }
                }
            }
        }

        info!("Shutdown requested, draining in-flight tasks");
        self.drain().await;
        queue.disconnect().await;
        info!("Dispatcher stopped");
    }

    /// Resolve one envelope to its record and spawn its executor.
    pub async fn dispatch(&self, envelope: Envelope) {
        let task_id = envelope.task_id.clone();
        let task = match self.task_manager.get_task(&task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!("[{}] Task record not found, dropping envelope", task_id);
                return;
            }
            Err(e) => {
                error!("[{}] Failed to load task record: {}", task_id, e);
                return;
            }
        };

        let known = envelope
            .task_type
            .parse::<TaskType>()
            .ok()
            .filter(|task_type| self.task_manager.has_processor(*task_type));
        if known.is_none() {
            let message = format!("Unknown task type: {}", envelope.task_type);
            error!("[{}] {}", task_id, message);
            if let Err(e) = self.task_manager.fail_task(&task_id, &message).await {
                error!("[{}] Failed to mark task as failed: {}", task_id, e);
            }
            return;
        }

        debug!("[{}] Dispatching {} task", task_id, envelope.task_type);
        let task_manager = self.task_manager.clone();
        let gate = self.gate.clone();
        self.executors.spawn(async move {
            let _permit = match gate.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("[{}] Concurrency gate closed: {}", task.id, e);
                    return;
                }
            };
            task_manager.execute(task).await;
        });
    }

    /// Wait for every dispatched executor to finish, bounded by the drain
    /// timeout. Executors spawned but not yet holding a slot are waited for too.
    pub async fn drain(&self) -> bool {
        self.executors.close();
        match timeout(self.config.drain_timeout, self.executors.wait()).await {
            Ok(()) => {
                info!("All in-flight tasks finished");
                true
            }
            Err(_) => {
                warn!(
                    "Drain timed out after {:?} with {} task(s) still in flight",
                    self.config.drain_timeout,
                    self.in_flight()
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_wait_resolves_after_trigger() {
        let flag = ShutdownFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.wait().await })
        };
        sleep(Duration::from_millis(10)).await;
        assert!(!flag.is_triggered());

        flag.trigger();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(flag.is_triggered());
    }

    #[tokio::test]
    async fn wait_on_triggered_flag_returns_immediately() {
        let flag = ShutdownFlag::new();
        flag.trigger();
        timeout(Duration::from_millis(100), flag.wait()).await.unwrap();
    }
}
