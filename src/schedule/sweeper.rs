use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::queue::TaskQueue;
use crate::schedule::scheduler::ShutdownFlag;
use crate::schedule::types::TaskType;
use crate::storage::task::TaskStorage;

/// Age past which a leftover workspace is removed whatever its task's state.
pub const STALE_WORKSPACE_AGE: Duration = Duration::from_secs(3 * 3600);

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub retention: chrono::Duration,
    pub stale_after: Duration,
    pub interval: Duration,
    pub output_dir: PathBuf,
    pub temp_root: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub removed: usize,
    pub bytes_freed: u64,
}

impl PassReport {
    fn add(&mut self, bytes: u64) {
        self.removed += 1;
        self.bytes_freed += bytes;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: PassReport,
    pub orphans: PassReport,
    pub workspaces: PassReport,
}

/// Delete a file, returning its size. A file that is already gone is not an error.
async fn remove_file(path: &Path) -> std::io::Result<u64> {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(size),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Task id owning an output file named `{id}_{suffix}.mp4`.
fn owner_of(filename: &str) -> Option<&str> {
    let stem = filename.strip_suffix(".mp4")?;
    let (id, suffix) = stem.split_once('_')?;
    (!id.is_empty() && !suffix.is_empty()).then_some(id)
}

/// Whether a directory name looks like `{prefix}{uuid}_...`, as created by executors.
fn is_workspace(name: &str) -> bool {
    TaskType::ALL.iter().any(|task_type| {
        name.strip_prefix(task_type.workspace_prefix())
            .and_then(|rest| rest.get(..36).zip(rest.get(36..)))
            .is_some_and(|(id, tail)| Uuid::parse_str(id).is_ok() && tail.starts_with('_'))
    })
}

/// Last path segment of a result URL, rejected if it could escape the output dir.
fn result_filename(result_ref: &str) -> Option<&str> {
    let name = result_ref.rsplit('/').next()?;
    (!name.is_empty() && name != ".." && name != "." && !name.contains('\\')).then_some(name)
}

/// Periodic reconciliation of output files, cache mirrors and workspaces.
pub struct Sweeper {
    storage: Arc<dyn TaskStorage>,
    queue: Arc<dyn TaskQueue>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(storage: Arc<dyn TaskStorage>, queue: Arc<dyn TaskQueue>, config: SweeperConfig) -> Self {
        Self { storage, queue, config }
    }

    pub async fn run(&self, shutdown: ShutdownFlag) {
        info!("Sweeper started, interval {:?}", self.config.interval);
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.wait() => {
                    info!("Sweeper stopped");
                    return;
                }
            }
        }
    }

    /// Run all three passes. A failing pass is logged and does not stop the others.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.sweep_expired().await {
            Ok(pass) => report.expired = pass,
            Err(e) => error!("Expired task sweep failed: {:#}", e),
        }
        match self.sweep_orphans().await {
            Ok(pass) => report.orphans = pass,
            Err(e) => error!("Orphan file sweep failed: {:#}", e),
        }
        match self.sweep_stale_workspaces().await {
            Ok(pass) => report.workspaces = pass,
            Err(e) => error!("Stale workspace sweep failed: {:#}", e),
        }

        info!(
            "Sweep finished: {} expired tasks, {} orphan files, {} stale workspaces, {} bytes freed",
            report.expired.removed,
            report.orphans.removed,
            report.workspaces.removed,
            report.expired.bytes_freed + report.orphans.bytes_freed + report.workspaces.bytes_freed
        );
        report
    }

    /// Remove the output file, cache mirror and record of every terminal task
    /// past the retention window.
    pub async fn sweep_expired(&self) -> Result<PassReport> {
        let cutoff = Utc::now() - self.config.retention;
        let tasks = self.storage.list_terminal_older_than(cutoff).await?;
        let mut report = PassReport::default();

        for task in tasks {
            let mut freed = 0;
            if let Some(name) = task.result_ref.as_deref().and_then(result_filename) {
                match remove_file(&self.config.output_dir.join(name)).await {
                    Ok(bytes) => freed = bytes,
                    Err(e) => {
                        warn!("[{}] Failed to delete output {}: {}", task.id, name, e);
                        continue;
                    }
                }
            }

            self.queue.delete_envelope(&task.id).await;

            match self.storage.delete(&task.id).await {
                Ok(_) => {
                    debug!("[{}] Expired task removed", task.id);
                    report.add(freed);
                }
                Err(e) => warn!("[{}] Failed to delete record: {}", task.id, e),
            }
        }

        Ok(report)
    }

    /// Remove output files whose owning task has no record.
    pub async fn sweep_orphans(&self) -> Result<PassReport> {
        let mut report = PassReport::default();
        let mut entries = match tokio::fs::read_dir(&self.config.output_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(task_id) = name.to_str().and_then(owner_of) else {
                continue;
            };

            match self.storage.get(task_id).await {
                Ok(Some(_)) => {}
                Ok(None) => match remove_file(&entry.path()).await {
                    Ok(bytes) => {
                        info!("Deleted orphan file {}", entry.path().display());
                        report.add(bytes);
                    }
                    Err(e) => warn!("Failed to delete orphan file {}: {}", entry.path().display(), e),
                },
                Err(e) => warn!("[{}] Lookup failed, keeping {:?}: {}", task_id, name, e),
            }
        }

        Ok(report)
    }

    /// Remove executor workspaces older than the stale threshold.
    pub async fn sweep_stale_workspaces(&self) -> Result<PassReport> {
        let mut report = PassReport::default();
        let mut entries = match tokio::fs::read_dir(&self.config.temp_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_str().is_some_and(is_workspace) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_dir() => metadata,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!("Failed to stat {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            let age = metadata.modified().ok().and_then(|modified| modified.elapsed().ok());
            if !age.is_some_and(|age| age > self.config.stale_after) {
                continue;
            }

            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    info!("Deleted stale workspace {}", entry.path().display());
                    report.add(0);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete workspace {}: {}", entry.path().display(), e),
            }
        }

        Ok(report)
    }
}
