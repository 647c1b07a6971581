use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Instant};

use super::*;
use crate::asr::{ModelSize, SpeechEngine, TranscribeSegment};
use crate::fetch::Fetcher;
use crate::media::{MediaEngine, MusicMix, ResizeMode, SceneMix};
use crate::queue::{Envelope, MemoryTaskQueue, TaskQueue};
use crate::schedule::types::{CaptionParams, MergeParams};
use crate::storage::task::SqliteTaskStorage;

const PUBLIC_URL: &str = "http://media.test";

struct MockProcessor {
    task_type: TaskType,
    delay: Duration,
    fail: bool,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl MockProcessor {
    fn new(task_type: TaskType, delay: Duration) -> Self {
        Self {
            task_type,
            delay,
            fail: false,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    fn failing(task_type: TaskType) -> Self {
        Self { fail: true, ..Self::new(task_type, Duration::ZERO) }
    }
}

#[async_trait]
impl TaskProcessor for MockProcessor {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    fn required_disk_space(&self, _task: &Task, _max_file_size: u64) -> u64 {
        0
    }

    async fn process(&self, ctx: &TaskContext<'_>) -> Result<u64> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        assert!(ctx.workspace.is_dir());

        sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        tokio::fs::write(ctx.output_path, b"partial").await?;
        if self.fail {
            return Err(anyhow::anyhow!("boom"));
        }
        Ok(7)
    }
}

struct Harness {
    manager: Arc<TaskManager>,
    queue: Arc<MemoryTaskQueue>,
    storage: Arc<SqliteTaskStorage>,
    output: TempDir,
    temp: TempDir,
}

impl Harness {
    async fn new(processors: Vec<Arc<dyn TaskProcessor>>, task_timeout: Option<Duration>) -> Self {
        let storage = Arc::new(SqliteTaskStorage::in_memory().await.unwrap());
        let queue = Arc::new(MemoryTaskQueue::new(Duration::from_secs(3600)));
        let output = TempDir::new().unwrap();
        let temp = TempDir::new().unwrap();
        let fetcher = Fetcher::new(1024 * 1024).unwrap().with_backoff_unit(Duration::from_millis(10));

        let mut manager = TaskManager::new(
            storage.clone(),
            queue.clone(),
            Arc::new(fetcher),
            output.path(),
            temp.path(),
            PUBLIC_URL,
        )
        .with_task_timeout(task_timeout);
        for processor in processors {
            manager.register_processor(processor);
        }

        Self {
            manager: Arc::new(manager),
            queue,
            storage,
            output,
            temp,
        }
    }

    fn dispatcher(&self, max_workers: usize) -> Arc<TaskDispatcher> {
        Arc::new(TaskDispatcher::new(
            self.manager.clone(),
            DispatcherConfig {
                max_workers,
                dequeue_timeout: Duration::from_millis(50),
                error_backoff: Duration::from_millis(50),
                drain_timeout: Duration::from_secs(5),
            },
        ))
    }

    async fn wait_terminal(&self, task_id: &str) -> Task {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let task = self.storage.get(task_id).await.unwrap().unwrap();
            if task.status.is_terminal() {
                return task;
            }
            assert!(Instant::now() < deadline, "task {} never finished", task_id);
            sleep(Duration::from_millis(20)).await;
        }
    }

    fn workspaces_left(&self) -> usize {
        std::fs::read_dir(self.temp.path()).unwrap().count()
    }
}

fn caption_params() -> TaskParams {
    TaskParams::Caption(CaptionParams {
        video_url: "https://cdn.example.com/in.mp4".to_string(),
        model_size: ModelSize::Tiny,
    })
}

fn spawn_dispatcher(dispatcher: Arc<TaskDispatcher>, shutdown: ShutdownFlag) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { dispatcher.run(shutdown).await })
}

#[tokio::test]
async fn concurrency_gate_limits_parallel_executors() {
    let processor = Arc::new(MockProcessor::new(TaskType::Caption, Duration::from_millis(100)));
    let harness = Harness::new(vec![processor.clone() as Arc<dyn TaskProcessor>], None).await;
    let shutdown = ShutdownFlag::new();
    let handle = spawn_dispatcher(harness.dispatcher(2), shutdown.clone());

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(harness.manager.submit(caption_params()).await.unwrap().id);
    }
    for id in &ids {
        assert_eq!(harness.wait_terminal(id).await.status, TaskStatus::Success);
    }

    assert_eq!(processor.max_running.load(Ordering::SeqCst), 2);

    shutdown.trigger();
    timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn successful_task_records_result() {
    let processor = Arc::new(MockProcessor::new(TaskType::Caption, Duration::ZERO));
    let harness = Harness::new(vec![processor as Arc<dyn TaskProcessor>], None).await;
    let shutdown = ShutdownFlag::new();
    let handle = spawn_dispatcher(harness.dispatcher(3), shutdown.clone());

    let task = harness.manager.submit(caption_params()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);

    let done = harness.wait_terminal(&task.id).await;
    let filename = format!("{}_captioned.mp4", task.id);
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.result_ref, Some(format!("{}/video/{}", PUBLIC_URL, filename)));
    assert_eq!(done.file_size, Some(7));
    assert!(done.completed_at.is_some());
    assert!(harness.output.path().join(filename).exists());
    assert_eq!(harness.workspaces_left(), 0);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn failing_task_is_marked_failed_and_cleaned_up() {
    let processor = Arc::new(MockProcessor::failing(TaskType::Caption));
    let harness = Harness::new(vec![processor as Arc<dyn TaskProcessor>], None).await;
    let shutdown = ShutdownFlag::new();
    let handle = spawn_dispatcher(harness.dispatcher(1), shutdown.clone());

    let task = harness.manager.submit(caption_params()).await.unwrap();
    let failed = harness.wait_terminal(&task.id).await;

    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("Caption task failed: boom"));
    assert!(failed.result_ref.is_none());
    assert!(!harness.output.path().join(task.output_filename()).exists());
    assert_eq!(harness.workspaces_left(), 0);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn unknown_task_type_is_failed() {
    let harness = Harness::new(vec![Arc::new(MockProcessor::new(TaskType::Caption, Duration::ZERO)) as Arc<dyn TaskProcessor>], None).await;
    let task = Task::new(caption_params());
    harness.storage.insert(&task).await.unwrap();
    harness.queue.enqueue(&Envelope::new(task.id.clone(), "transcode")).await.unwrap();

    let shutdown = ShutdownFlag::new();
    let handle = spawn_dispatcher(harness.dispatcher(1), shutdown.clone());

    let failed = harness.wait_terminal(&task.id).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("Unknown task type: transcode"));

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn type_without_processor_is_failed() {
    let harness = Harness::new(vec![Arc::new(MockProcessor::new(TaskType::Caption, Duration::ZERO)) as Arc<dyn TaskProcessor>], None).await;
    let task = Task::new(caption_params());
    harness.storage.insert(&task).await.unwrap();
    harness.queue.enqueue(&Envelope::new(task.id.clone(), "merge")).await.unwrap();

    let shutdown = ShutdownFlag::new();
    let handle = spawn_dispatcher(harness.dispatcher(1), shutdown.clone());

    let failed = harness.wait_terminal(&task.id).await;
    assert_eq!(failed.error.as_deref(), Some("Unknown task type: merge"));

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn missing_record_is_dropped_and_loop_continues() {
    let harness = Harness::new(vec![Arc::new(MockProcessor::new(TaskType::Caption, Duration::ZERO)) as Arc<dyn TaskProcessor>], None).await;
    harness.queue.enqueue(&Envelope::new("ghost", "caption")).await.unwrap();
    let task = harness.manager.submit(caption_params()).await.unwrap();

    let shutdown = ShutdownFlag::new();
    let handle = spawn_dispatcher(harness.dispatcher(1), shutdown.clone());

    assert_eq!(harness.wait_terminal(&task.id).await.status, TaskStatus::Success);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn duplicate_delivery_runs_once() {
    let processor = Arc::new(MockProcessor::new(TaskType::Caption, Duration::from_millis(50)));
    let harness = Harness::new(vec![processor as Arc<dyn TaskProcessor>], None).await;
    let task = harness.manager.submit(caption_params()).await.unwrap();
    harness.queue.enqueue(&Envelope::new(task.id.clone(), "caption")).await.unwrap();

    let shutdown = ShutdownFlag::new();
    let dispatcher = harness.dispatcher(2);
    let handle = spawn_dispatcher(dispatcher.clone(), shutdown.clone());

    let done = harness.wait_terminal(&task.id).await;
    assert_eq!(done.status, TaskStatus::Success);

    shutdown.trigger();
    handle.await.unwrap();
    assert_eq!(harness.storage.get(&task.id).await.unwrap().unwrap().status, TaskStatus::Success);
}

#[tokio::test]
async fn shutdown_drains_in_flight_tasks() {
    let processor = Arc::new(MockProcessor::new(TaskType::Caption, Duration::from_millis(300)));
    let harness = Harness::new(vec![processor.clone() as Arc<dyn TaskProcessor>], None).await;
    let shutdown = ShutdownFlag::new();
    let handle = spawn_dispatcher(harness.dispatcher(2), shutdown.clone());

    let task = harness.manager.submit(caption_params()).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while processor.running.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline);
        sleep(Duration::from_millis(10)).await;
    }

    shutdown.trigger();
    timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

    // the loop returned only after the running task finished
    let done = harness.storage.get(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Success);
    assert!(!harness.queue.is_healthy().await);
    assert_eq!(harness.queue.queue_length().await, 0);
}

#[tokio::test]
async fn drain_waits_for_executor_not_yet_holding_a_slot() {
    let processor = Arc::new(MockProcessor::new(TaskType::Caption, Duration::from_millis(50)));
    let harness = Harness::new(vec![processor.clone() as Arc<dyn TaskProcessor>], None).await;
    let dispatcher = harness.dispatcher(1);

    let task = harness.manager.submit(caption_params()).await.unwrap();
    let envelope = harness.queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();

    // the spawned executor has not been polled yet on this runtime
    dispatcher.dispatch(envelope).await;
    assert_eq!(dispatcher.in_flight(), 1);
    assert_eq!(dispatcher.busy_slots(), 0);

    assert!(dispatcher.drain().await);
    assert_eq!(dispatcher.in_flight(), 0);
    let done = harness.storage.get(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Success);
}

#[tokio::test]
async fn drain_gives_up_after_timeout() {
    let processor = Arc::new(MockProcessor::new(TaskType::Caption, Duration::from_secs(5)));
    let harness = Harness::new(vec![processor as Arc<dyn TaskProcessor>], None).await;
    let dispatcher = Arc::new(TaskDispatcher::new(
        harness.manager.clone(),
        DispatcherConfig {
            max_workers: 1,
            drain_timeout: Duration::from_millis(100),
            ..DispatcherConfig::default()
        },
    ));

    harness.manager.submit(caption_params()).await.unwrap();
    let envelope = harness.queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
    dispatcher.dispatch(envelope).await;

    assert!(!dispatcher.drain().await);
    assert_eq!(dispatcher.in_flight(), 1);
}

#[tokio::test]
async fn task_deadline_fails_slow_task() {
    let processor = Arc::new(MockProcessor::new(TaskType::Caption, Duration::from_secs(2)));
    let harness = Harness::new(vec![processor as Arc<dyn TaskProcessor>], Some(Duration::from_millis(50))).await;
    let task = harness.manager.submit(caption_params()).await.unwrap();

    harness.manager.execute(harness.storage.get(&task.id).await.unwrap().unwrap()).await;

    let failed = harness.storage.get(&task.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.error.unwrap().contains("timed out"));
    assert_eq!(harness.workspaces_left(), 0);
}

#[tokio::test]
async fn submit_rejects_invalid_params() {
    let harness = Harness::new(vec![Arc::new(MockProcessor::new(TaskType::Merge, Duration::ZERO)) as Arc<dyn TaskProcessor>], None).await;
    let params = TaskParams::Merge(MergeParams {
        scene_clip_urls: vec!["https://h/a.mp4".to_string()],
        voiceover_urls: vec![],
        width: 1080,
        height: 1920,
        video_volume: 0.2,
        voiceover_volume: 2.0,
        resize_mode: ResizeMode::Cover,
    });

    assert!(harness.manager.submit(params).await.is_err());
    assert_eq!(harness.queue.queue_length().await, 0);
}

#[tokio::test]
async fn submit_without_processor_is_rejected() {
    let harness = Harness::new(vec![], None).await;
    assert!(harness.manager.submit(caption_params()).await.is_err());
}

#[tokio::test]
async fn enqueue_failure_marks_task_failed() {
    let harness = Harness::new(vec![Arc::new(MockProcessor::new(TaskType::Caption, Duration::ZERO)) as Arc<dyn TaskProcessor>], None).await;
    harness.queue.disconnect().await;

    assert!(harness.manager.submit(caption_params()).await.is_err());

    let failed = harness
        .storage
        .list_terminal_older_than(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, TaskStatus::Failed);
    assert!(failed[0].error.as_deref().unwrap().starts_with("Failed to enqueue task"));
}

#[tokio::test]
async fn health_reports_components() {
    let harness = Harness::new(vec![], None).await;
    harness.queue.enqueue(&Envelope::new("a", "caption")).await.unwrap();

    let report = harness.manager.health().await;
    assert!(report.database);
    assert!(report.queue);
    assert_eq!(report.queue_length, 1);

    harness.queue.disconnect().await;
    let report = harness.manager.health().await;
    assert!(!report.queue);
    assert_eq!(report.queue_length, 0);
}

#[derive(Default)]
struct RecordingMedia {
    srt: Mutex<Option<String>>,
    scenes: Mutex<Vec<SceneMix>>,
    concat_inputs: Mutex<Vec<PathBuf>>,
    music: Mutex<Option<MusicMix>>,
}

#[async_trait]
impl MediaEngine for RecordingMedia {
    async fn burn_subtitles(&self, video_path: &Path, srt_text: &str, output: &Path) -> Result<()> {
        assert!(video_path.exists());
        *self.srt.lock().unwrap() = Some(srt_text.to_string());
        tokio::fs::write(output, b"captioned").await?;
        Ok(())
    }

    async fn merge_scene(&self, scene: &SceneMix, output: &Path) -> Result<()> {
        assert!(scene.video_path.exists() && scene.audio_path.exists());
        self.scenes.lock().unwrap().push(scene.clone());
        tokio::fs::write(output, b"scene").await?;
        Ok(())
    }

    async fn concat(&self, clips: &[PathBuf], output: &Path) -> Result<()> {
        *self.concat_inputs.lock().unwrap() = clips.to_vec();
        tokio::fs::write(output, b"merged").await?;
        Ok(())
    }

    async fn add_background_music(&self, mix: &MusicMix, output: &Path) -> Result<()> {
        *self.music.lock().unwrap() = Some(mix.clone());
        tokio::fs::write(output, b"music").await?;
        Ok(())
    }
}

struct ScriptedSpeech;

#[async_trait]
impl SpeechEngine for ScriptedSpeech {
    async fn transcribe(&self, media_path: &Path, model_size: ModelSize) -> Result<Vec<TranscribeSegment>> {
        assert!(media_path.exists());
        assert_eq!(model_size, ModelSize::Tiny);
        Ok(vec![TranscribeSegment { start: 0.0, end: 1.5, text: " hello world ".to_string() }])
    }
}

async fn serve_media() -> SocketAddr {
    let router = Router::new()
        .route("/in.mp4", get(|| async { vec![1u8; 64] }))
        .route("/voice.mp3", get(|| async { vec![2u8; 16] }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn caption_processor_downloads_transcribes_and_burns() {
    let addr = serve_media().await;
    let media = Arc::new(RecordingMedia::default());
    let processor = Arc::new(CaptionProcessor::new(Arc::new(ScriptedSpeech), media.clone()));
    let harness = Harness::new(vec![processor as Arc<dyn TaskProcessor>], None).await;

    let params = TaskParams::Caption(CaptionParams {
        video_url: format!("http://{}/in.mp4", addr),
        model_size: ModelSize::Tiny,
    });
    let task = harness.manager.submit(params).await.unwrap();
    harness.manager.execute(task.clone()).await;

    let done = harness.storage.get(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Success, "error: {:?}", done.error);
    assert_eq!(done.file_size, Some(64));
    let srt = media.srt.lock().unwrap().clone().unwrap();
    assert_eq!(srt, "1\n00:00:00,000 --> 00:00:01,500\nhello world\n");
    assert_eq!(harness.workspaces_left(), 0);
}

#[tokio::test]
async fn merge_processor_mixes_every_scene_then_concatenates() {
    let addr = serve_media().await;
    let media = Arc::new(RecordingMedia::default());
    let harness = Harness::new(vec![Arc::new(MergeProcessor::new(media.clone())) as Arc<dyn TaskProcessor>], None).await;

    let video = format!("http://{}/in.mp4", addr);
    let voice = format!("http://{}/voice.mp3", addr);
    let params = TaskParams::Merge(MergeParams {
        scene_clip_urls: vec![video.clone(), video],
        voiceover_urls: vec![voice.clone(), voice],
        width: 720,
        height: 1280,
        video_volume: 0.2,
        voiceover_volume: 2.0,
        resize_mode: ResizeMode::Contain,
    });
    let task = harness.manager.submit(params).await.unwrap();
    harness.manager.execute(task.clone()).await;

    let done = harness.storage.get(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Success, "error: {:?}", done.error);
    assert_eq!(done.file_size, Some(2 * (64 + 16)));

    let scenes = media.scenes.lock().unwrap().clone();
    assert_eq!(scenes.len(), 2);
    assert!(scenes.iter().all(|s| s.width == 720 && s.height == 1280 && s.duration_secs == 5.0));
    assert!(scenes.iter().all(|s| s.resize_mode == ResizeMode::Contain));
    let clips = media.concat_inputs.lock().unwrap().clone();
    assert_eq!(clips.len(), 2);
    assert!(clips[0].ends_with("scene_0_final.mp4"));
}

#[tokio::test]
async fn unreachable_input_fails_task() {
    let media = Arc::new(RecordingMedia::default());
    let harness = Harness::new(vec![Arc::new(BackgroundMusicProcessor::new(media.clone())) as Arc<dyn TaskProcessor>], None).await;

    let addr = serve_media().await;
    let params = TaskParams::BackgroundMusic(crate::schedule::types::BackgroundMusicParams {
        video_url: format!("http://{}/in.mp4", addr),
        music_url: format!("http://{}/missing.mp3", addr),
        music_volume: 0.3,
        video_volume: 1.0,
    });
    let task = harness.manager.submit(params).await.unwrap();
    harness.manager.execute(task.clone()).await;

    let failed = harness.storage.get(&task.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    let error = failed.error.unwrap();
    assert!(error.starts_with("Background music task failed: Resource not found"), "{}", error);
    assert!(media.music.lock().unwrap().is_none());
    assert_eq!(harness.workspaces_left(), 0);
}
