use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{params_mismatch, TaskContext, TaskProcessor};
use crate::media::{MediaEngine, SceneMix};
use crate::schedule::types::{Task, TaskParams, TaskType};

/// Length of every scene in the merged video.
pub const SCENE_DURATION_SECS: f32 = 5.0;

/// Lays a voiceover under each scene clip, then joins the scenes in order.
#[derive(Clone)]
pub struct MergeProcessor {
    media: Arc<dyn MediaEngine>,
}

impl MergeProcessor {
    pub fn new(media: Arc<dyn MediaEngine>) -> Self {
        Self { media }
    }
}

#[async_trait]
impl TaskProcessor for MergeProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::Merge
    }

    fn required_disk_space(&self, task: &Task, max_file_size: u64) -> u64 {
        let scenes = match &task.params {
            TaskParams::Merge(params) => params.scene_clip_urls.len() as u64,
            _ => 1,
        };
        max_file_size.saturating_mul(scenes).saturating_mul(5)
    }

    async fn process(&self, ctx: &TaskContext<'_>) -> Result<u64> {
        let TaskParams::Merge(params) = &ctx.task.params else {
            return Err(params_mismatch(ctx.task, TaskType::Merge));
        };
        let task_id = &ctx.task.id;
        let total = params.scene_clip_urls.len();

        let mut total_bytes = 0;
        let mut scenes: Vec<PathBuf> = Vec::with_capacity(total);

        for (i, (scene_url, voice_url)) in params.scene_clip_urls.iter().zip(&params.voiceover_urls).enumerate() {
            info!("[{}] Processing scene {}/{}", task_id, i + 1, total);

            let video_path = ctx.workspace.join(format!("scene_{}_video.mp4", i));
            let audio_path = ctx.workspace.join(format!("scene_{}_audio.mp3", i));
            total_bytes += ctx.fetcher.fetch(scene_url, &video_path).await?.bytes;
            total_bytes += ctx.fetcher.fetch(voice_url, &audio_path).await?.bytes;

            let scene_output = ctx.workspace.join(format!("scene_{}_final.mp4", i));
            let mix = SceneMix {
                video_path,
                audio_path,
                video_volume: params.video_volume,
                audio_volume: params.voiceover_volume,
                duration_secs: SCENE_DURATION_SECS,
                width: params.width,
                height: params.height,
                resize_mode: params.resize_mode,
            };
            self.media.merge_scene(&mix, &scene_output).await?;
            scenes.push(scene_output);
        }

        info!("[{}] Concatenating {} scenes", task_id, scenes.len());
        self.media.concat(&scenes, ctx.output_path).await?;

        Ok(total_bytes)
    }
}
