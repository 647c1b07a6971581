pub mod background_music;
pub mod caption;
pub mod merge;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use crate::fetch::Fetcher;
use crate::schedule::types::{Task, TaskType};

pub use background_music::BackgroundMusicProcessor;
pub use caption::CaptionProcessor;
pub use merge::MergeProcessor;

/// Everything an executor hands to a processor for one run.
pub struct TaskContext<'a> {
    pub task: &'a Task,
    /// Scratch directory owned by this run, removed afterwards.
    pub workspace: &'a Path,
    /// Where the final file must be written.
    pub output_path: &'a Path,
    pub fetcher: &'a Fetcher,
}

#[async_trait]
pub trait TaskProcessor: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// Scratch bytes needed before any download starts.
    fn required_disk_space(&self, task: &Task, max_file_size: u64) -> u64;

    /// Fetch inputs, transform them into `ctx.output_path` and return the
    /// number of input bytes processed.
    async fn process(&self, ctx: &TaskContext<'_>) -> Result<u64>;
}

fn params_mismatch(task: &Task, expected: TaskType) -> anyhow::Error {
    anyhow::anyhow!("Task {} has {} params, expected {}", task.id, task.params.task_type(), expected)
}
