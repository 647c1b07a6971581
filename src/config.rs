use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

pub const MEMORY_QUEUE_URL: &str = "memory://";

#[derive(Debug, Clone, Parser)]
#[command(name = "media-task-rs", version = env!("GIT_HASH"), about = "Media task orchestration service")]
pub struct Settings {
    /// Queue broker address; `memory://` keeps the queue in process
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./media_data/database/tasks.db?mode=rwc")]
    pub database_url: String,

    #[arg(long, env = "MAX_FILE_SIZE_MB", default_value_t = 100)]
    pub max_file_size_mb: u64,

    #[arg(long, env = "MAX_CONCURRENT_WORKERS", default_value_t = 3)]
    pub max_concurrent_workers: usize,

    /// Retention window for finished tasks and their cache mirrors
    #[arg(long, env = "TASK_TTL_HOURS", default_value_t = 2)]
    pub task_ttl_hours: u64,

    #[arg(long, env = "VIDEO_OUTPUT_DIR", default_value = "/tmp/videos")]
    pub video_output_dir: PathBuf,

    #[arg(long, env = "WHISPER_MODEL_CACHE_DIR", default_value = "./models")]
    pub whisper_model_cache_dir: PathBuf,

    /// Parent directory of per-task workspaces; the system temp dir when unset
    #[arg(long, env = "TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Base URL used to build result links
    #[arg(long, env = "PUBLIC_URL", default_value = "http://127.0.0.1:7200")]
    pub public_url: String,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 7200)]
    pub port: u16,

    #[arg(long, env = "FETCH_MAX_ATTEMPTS", default_value_t = 3)]
    pub fetch_max_attempts: u32,

    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 3600)]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,

    /// Per-task deadline, 0 disables it
    #[arg(long, env = "TASK_TIMEOUT_SECS", default_value_t = 0)]
    pub task_timeout_secs: u64,

    #[arg(long, env = "LOG_DIR", default_value = "./logs")]
    pub log_dir: String,
}

impl Settings {
    /// Load `.env` first, then parse arguments and environment.
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        Self::parse()
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_hours * 3600)
    }

    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }

    pub fn uses_memory_queue(&self) -> bool {
        self.redis_url.starts_with(MEMORY_QUEUE_URL)
    }

    /// Check required values and create the directories the service writes to.
    pub fn validate(&self) -> Result<()> {
        if self.redis_url.trim().is_empty() {
            return Err(anyhow::anyhow!("REDIS_URL must be set"));
        }
        if self.database_url.trim().is_empty() {
            return Err(anyhow::anyhow!("DATABASE_URL must be set"));
        }
        if self.max_file_size_mb == 0 {
            return Err(anyhow::anyhow!("MAX_FILE_SIZE_MB must be greater than 0"));
        }
        if self.max_concurrent_workers == 0 {
            return Err(anyhow::anyhow!("MAX_CONCURRENT_WORKERS must be greater than 0"));
        }
        if self.task_ttl_hours == 0 {
            return Err(anyhow::anyhow!("TASK_TTL_HOURS must be greater than 0"));
        }
        if self.fetch_max_attempts == 0 {
            return Err(anyhow::anyhow!("FETCH_MAX_ATTEMPTS must be greater than 0"));
        }

        std::fs::create_dir_all(&self.video_output_dir)?;
        std::fs::create_dir_all(&self.whisper_model_cache_dir)?;
        std::fs::create_dir_all(self.temp_root())?;

        if let Some(db_path) = self.database_url.strip_prefix("sqlite://") {
            let db_path = db_path.split('?').next().unwrap_or(db_path);
            if let Some(dir) = std::path::Path::new(db_path).parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(args: &[&str]) -> Settings {
        let mut argv = vec!["media-task-rs"];
        argv.extend_from_slice(args);
        Settings::parse_from(argv)
    }

    #[test]
    fn derived_values() {
        let s = settings(&["--max-file-size-mb", "2", "--task-ttl-hours", "3"]);
        assert_eq!(s.max_file_size(), 2 * 1024 * 1024);
        assert_eq!(s.task_ttl(), Duration::from_secs(3 * 3600));
        assert_eq!(s.task_timeout(), None);
    }

    #[test]
    fn memory_queue_is_detected() {
        assert!(settings(&["--redis-url", "memory://"]).uses_memory_queue());
        assert!(!settings(&["--redis-url", "redis://localhost"]).uses_memory_queue());
    }

    #[test]
    fn validate_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let models = dir.path().join("models");
        let db = dir.path().join("db/tasks.db");
        let s = settings(&[
            "--video-output-dir",
            out.to_str().unwrap(),
            "--whisper-model-cache-dir",
            models.to_str().unwrap(),
            "--temp-dir",
            dir.path().to_str().unwrap(),
            "--database-url",
            &format!("sqlite://{}?mode=rwc", db.display()),
        ]);
        s.validate().unwrap();
        assert!(out.is_dir());
        assert!(models.is_dir());
        assert!(dir.path().join("db").is_dir());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(&["--max-concurrent-workers", "0", "--video-output-dir", dir.path().to_str().unwrap()]);
        assert!(s.validate().is_err());
    }
}
