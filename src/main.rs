#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use tracing::{error, info};
use std::sync::Arc;
use std::net::SocketAddr;
use std::time::Duration;
use media_task_rs::{
    asr::whisper::WhisperAsr,
    config::Settings,
    fetch::Fetcher,
    media::ffmpeg::FfmpegEngine,
    queue,
    schedule::{
        BackgroundMusicProcessor, CaptionProcessor, DispatcherConfig, MergeProcessor, Sweeper, SweeperConfig,
        TaskManager, TaskScheduler,
    },
    schedule::sweeper::STALE_WORKSPACE_AGE,
    storage::task::SqliteTaskStorage,
    utils::logger,
    AppContext,
};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load();
    settings.validate()?;

    // keep the guard alive so buffered log lines are flushed on exit
    let _guard = logger::init(settings.log_dir.clone())?;
    info!("Starting media task service {}", env!("GIT_HASH"));

    info!("Initializing Storage...");
    let storage = Arc::new(SqliteTaskStorage::new(&settings.database_url).await?);

    info!("Connecting to queue...");
    let queue = queue::connect(&settings.redis_url, settings.task_ttl()).await?;
    if settings.uses_memory_queue() {
        info!("Using in-process queue, tasks will not survive a restart");
    }

    let fetcher = Fetcher::new(settings.max_file_size())?.with_max_attempts(settings.fetch_max_attempts);

    info!("Initializing Task Manager...");
    let media = Arc::new(FfmpegEngine::new());
    let speech = Arc::new(WhisperAsr::new(settings.whisper_model_cache_dir.clone()));
    let mut task_manager = TaskManager::new(
        storage.clone(),
        queue.clone(),
        Arc::new(fetcher),
        settings.video_output_dir.clone(),
        settings.temp_root(),
        settings.public_url.clone(),
    )
    .with_task_timeout(settings.task_timeout());
    task_manager.register_processor(Arc::new(CaptionProcessor::new(speech, media.clone())));
    task_manager.register_processor(Arc::new(MergeProcessor::new(media.clone())));
    task_manager.register_processor(Arc::new(BackgroundMusicProcessor::new(media)));
    let task_manager = Arc::new(task_manager);

    info!("Initializing Scheduler...");
    let sweeper = Sweeper::new(
        storage,
        queue,
        SweeperConfig {
            retention: chrono::Duration::hours(settings.task_ttl_hours as i64),
            stale_after: STALE_WORKSPACE_AGE,
            interval: Duration::from_secs(settings.sweep_interval_secs),
            output_dir: settings.video_output_dir.clone(),
            temp_root: settings.temp_root(),
        },
    );
    let scheduler = TaskScheduler::new(
        task_manager.clone(),
        DispatcherConfig {
            max_workers: settings.max_concurrent_workers,
            drain_timeout: Duration::from_secs(settings.drain_timeout_secs),
            ..DispatcherConfig::default()
        },
    )
    .with_sweeper(sweeper);
    scheduler.start().await;

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    let ctx = Arc::new(AppContext {
        task_manager,
        settings,
    });

    info!("Starting HTTP server at http://{}", addr);
    let served = media_task_rs::web::start_server(ctx, addr, shutdown_signal()).await;

    // stop taking work and let in-flight tasks finish before exiting
    info!("Shutting down...");
    scheduler.shutdown().await?;

    match served {
        Ok(()) => {
            info!("Server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
