pub mod asr;
pub mod audio;
pub mod config;
pub mod fetch;
pub mod media;
pub mod queue;
pub mod schedule;
pub mod storage;
pub mod utils;
pub mod web;

use std::sync::Arc;
use config::Settings;
use schedule::TaskManager;

/// Shared state handed to every HTTP handler.
pub struct AppContext {
    pub task_manager: Arc<TaskManager>,
    pub settings: Settings,
}
