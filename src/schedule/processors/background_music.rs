use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{params_mismatch, TaskContext, TaskProcessor};
use crate::media::{MediaEngine, MusicMix};
use crate::schedule::types::{Task, TaskParams, TaskType};

#[derive(Clone)]
pub struct BackgroundMusicProcessor {
    media: Arc<dyn MediaEngine>,
}

impl BackgroundMusicProcessor {
    pub fn new(media: Arc<dyn MediaEngine>) -> Self {
        Self { media }
    }
}

#[async_trait]
impl TaskProcessor for BackgroundMusicProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::BackgroundMusic
    }

    fn required_disk_space(&self, _task: &Task, max_file_size: u64) -> u64 {
        max_file_size.saturating_mul(4)
    }

    async fn process(&self, ctx: &TaskContext<'_>) -> Result<u64> {
        let TaskParams::BackgroundMusic(params) = &ctx.task.params else {
            return Err(params_mismatch(ctx.task, TaskType::BackgroundMusic));
        };
        let task_id = &ctx.task.id;

        let video_path = ctx.workspace.join("video.mp4");
        let music_path = ctx.workspace.join("music.mp3");

        info!("[{}] Downloading video from {}", task_id, params.video_url);
        let video = ctx.fetcher.fetch(&params.video_url, &video_path).await?;
        info!("[{}] Downloading music from {}", task_id, params.music_url);
        let music = ctx.fetcher.fetch(&params.music_url, &music_path).await?;

        let mix = MusicMix {
            video_path,
            music_path,
            music_volume: params.music_volume,
            video_volume: params.video_volume,
        };
        info!("[{}] Mixing background music", task_id);
        self.media.add_background_music(&mix, ctx.output_path).await?;

        Ok(video.bytes + music.bytes)
    }
}
