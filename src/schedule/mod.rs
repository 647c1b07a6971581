pub mod processors;
pub mod scheduler;
pub mod sweeper;
pub mod types;

#[cfg(test)]
mod tests;

pub use types::{StatusUpdate, Task, TaskParams, TaskStatus, TaskType};

pub use crate::storage::task::TaskStorage;

pub use processors::{BackgroundMusicProcessor, CaptionProcessor, MergeProcessor, TaskContext, TaskProcessor};

pub use scheduler::{DispatcherConfig, ShutdownFlag, TaskDispatcher, TaskManager, TaskScheduler};
pub use sweeper::{Sweeper, SweeperConfig};
