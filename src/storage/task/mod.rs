use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::schedule::types::{StatusUpdate, Task};

pub mod sqlite;

pub use sqlite::SqliteTaskStorage;

/// The authoritative task record store.
#[async_trait]
pub trait TaskStorage: Send + Sync + 'static {
    async fn insert(&self, task: &Task) -> Result<()>;
    async fn get(&self, task_id: &str) -> Result<Option<Task>>;
    /// Apply `update` only if the row currently holds one of the allowed
    /// predecessor statuses. Fails when the row is missing or the move is illegal.
    async fn transition(&self, task_id: &str, update: StatusUpdate) -> Result<()>;
    /// Terminal tasks whose `completed_at` is at or before `cutoff`.
    async fn list_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>>;
    /// Returns whether a row was removed.
    async fn delete(&self, task_id: &str) -> Result<bool>;
    async fn ping(&self) -> Result<()>;
}
