use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::fetch::{ensure_disk_space, Fetcher};
use crate::queue::{Envelope, TaskQueue};
use crate::schedule::processors::{TaskContext, TaskProcessor};
use crate::schedule::types::{StatusUpdate, Task, TaskParams, TaskStatus, TaskType};
use crate::storage::task::TaskStorage;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub database: bool,
    pub queue: bool,
    pub queue_length: usize,
}

pub struct TaskManager {
    storage: Arc<dyn TaskStorage>,
    queue: Arc<dyn TaskQueue>,
    fetcher: Arc<Fetcher>,
    processors: HashMap<TaskType, Arc<dyn TaskProcessor>>,
    output_dir: PathBuf,
    temp_root: PathBuf,
    public_url: String,
    task_timeout: Option<Duration>,
}

impl TaskManager {
    pub fn new(
        storage: Arc<dyn TaskStorage>,
        queue: Arc<dyn TaskQueue>,
        fetcher: Arc<Fetcher>,
        output_dir: impl Into<PathBuf>,
        temp_root: impl Into<PathBuf>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            queue,
            fetcher,
            processors: HashMap::new(),
            output_dir: output_dir.into(),
            temp_root: temp_root.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            task_timeout: None,
        }
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn register_processor(&mut self, processor: Arc<dyn TaskProcessor>) {
        let task_type = processor.task_type();
        info!("Registering processor for task type: {}", task_type);
        self.processors.insert(task_type, processor);
    }

    pub fn has_processor(&self, task_type: TaskType) -> bool {
        self.processors.contains_key(&task_type)
    }

    pub fn storage(&self) -> &Arc<dyn TaskStorage> {
        &self.storage
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    pub fn result_url(&self, filename: &str) -> String {
        format!("{}/video/{}", self.public_url, filename)
    }

    /// Validate, persist and enqueue a new task.
    ///
    /// A task whose envelope cannot be enqueued is marked FAILED so it never
    /// lingers as QUEUED.
    pub async fn submit(&self, params: TaskParams) -> Result<Task> {
        params.validate()?;
        let task_type = params.task_type();
        if !self.has_processor(task_type) {
            return Err(anyhow::anyhow!("No processor registered for task type: {}", task_type));
        }

        let task = Task::new(params);
        self.storage.insert(&task).await?;

        let envelope = Envelope::new(task.id.clone(), task_type.as_str());
        if let Err(e) = self.queue.enqueue(&envelope).await {
            error!("[{}] Failed to enqueue task: {}", task.id, e);
            self.fail_task(&task.id, &format!("Failed to enqueue task: {}", e)).await?;
            return Err(anyhow::anyhow!("Failed to enqueue task: {}", e));
        }

        info!("[{}] Created {} task", task.id, task_type);
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.storage.get(task_id).await
    }

    pub async fn health(&self) -> HealthReport {
        let database = match self.storage.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Database health check failed: {}", e);
                false
            }
        };
        HealthReport {
            database,
            queue: self.queue.is_healthy().await,
            queue_length: self.queue.queue_length().await,
        }
    }

    /// Move a task that will never run to FAILED, through RUNNING when it is
    /// still QUEUED.
    pub async fn fail_task(&self, task_id: &str, error: &str) -> Result<()> {
        if let Some(task) = self.storage.get(task_id).await? {
            if task.status == TaskStatus::Queued {
                self.storage.transition(task_id, StatusUpdate::Running).await?;
            }
        }
        self.storage
            .transition(task_id, StatusUpdate::Failed { error: error.to_string() })
            .await
    }

    /// Run one task to a terminal status. Never returns an error: every
    /// failure ends up on the record.
    pub async fn execute(&self, task: Task) {
        let task_id = task.id.clone();
        if let Err(e) = self.storage.transition(&task_id, StatusUpdate::Running).await {
            warn!("[{}] Not starting task: {}", task_id, e);
            return;
        }
        info!("[{}] Starting {} task", task_id, task.task_type);

        let filename = task.output_filename();
        let output_path = self.output_dir.join(&filename);

        let outcome = match self.task_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run(&task, &output_path)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::anyhow!("timed out after {} seconds", limit.as_secs())),
            },
            None => self.run(&task, &output_path).await,
        };

        match outcome {
            Ok(file_size) => {
                let result_ref = self.result_url(&filename);
                let update = StatusUpdate::Success { result_ref, file_size };
                match self.storage.transition(&task_id, update).await {
                    Ok(()) => info!("[{}] {} task completed successfully", task_id, task.task_type.label()),
                    Err(e) => error!("[{}] Failed to record success: {}", task_id, e),
                }
            }
            Err(e) => {
                let message = format!("{} task failed: {:#}", task.task_type.label(), e);
                error!("[{}] {}", task_id, message);
                remove_output(&output_path).await;
                if let Err(e) = self.storage.transition(&task_id, StatusUpdate::Failed { error: message }).await {
                    error!("[{}] Failed to record failure: {}", task_id, e);
                }
            }
        }
    }

    async fn run(&self, task: &Task, output_path: &Path) -> Result<u64> {
        let processor = self
            .processors
            .get(&task.task_type)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown task type: {}", task.task_type))?;

        // removed on drop, whatever happens below
        let workspace = tempfile::Builder::new()
            .prefix(&format!("{}{}_", task.task_type.workspace_prefix(), task.id))
            .tempdir_in(&self.temp_root)?;
        debug!("[{}] Workspace {}", task.id, workspace.path().display());

        let required = processor.required_disk_space(task, self.fetcher.max_file_size());
        ensure_disk_space(workspace.path(), required)?;
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let ctx = TaskContext {
            task,
            workspace: workspace.path(),
            output_path,
            fetcher: &self.fetcher,
        };
        processor.process(&ctx).await
    }
}

async fn remove_output(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", path.display(), e),
    }
}
