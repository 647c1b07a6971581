mod task_manager;
mod worker;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::schedule::sweeper::Sweeper;

pub use task_manager::{HealthReport, TaskManager};
pub use worker::{DispatcherConfig, ShutdownFlag, TaskDispatcher};

/// Owns the background loops: the dispatcher and, optionally, the sweeper.
pub struct TaskScheduler {
    task_manager: Arc<TaskManager>,
    dispatcher: Arc<TaskDispatcher>,
    sweeper: Option<Arc<Sweeper>>,
    shutdown: ShutdownFlag,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(task_manager: Arc<TaskManager>, config: DispatcherConfig) -> Self {
        Self {
            dispatcher: Arc::new(TaskDispatcher::new(task_manager.clone(), config)),
            task_manager,
            sweeper: None,
            shutdown: ShutdownFlag::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_sweeper(mut self, sweeper: Sweeper) -> Self {
        self.sweeper = Some(Arc::new(sweeper));
        self
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;

        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        workers.push(tokio::spawn(async move {
            dispatcher.run(shutdown).await;
        }));

        if let Some(sweeper) = self.sweeper.clone() {
            let shutdown = self.shutdown.clone();
            workers.push(tokio::spawn(async move {
                sweeper.run(shutdown).await;
            }));
        }
    }

    /// Signal every loop to stop and wait for them, including the drain.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Stopping scheduler");
        self.shutdown.trigger();

        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.await?;
        }

        info!("Scheduler stopped");
        Ok(())
    }
}
