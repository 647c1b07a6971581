use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::{params_mismatch, TaskContext, TaskProcessor};
use crate::asr::SpeechEngine;
use crate::media::subtitle::{build_srt, DEFAULT_MAX_WORDS_PER_LINE};
use crate::media::MediaEngine;
use crate::schedule::types::{Task, TaskParams, TaskType};

/// Transcribes a video and burns the transcript in as subtitles.
#[derive(Clone)]
pub struct CaptionProcessor {
    speech: Arc<dyn SpeechEngine>,
    media: Arc<dyn MediaEngine>,
}

impl CaptionProcessor {
    pub fn new(speech: Arc<dyn SpeechEngine>, media: Arc<dyn MediaEngine>) -> Self {
        Self { speech, media }
    }
}

#[async_trait]
impl TaskProcessor for CaptionProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::Caption
    }

    fn required_disk_space(&self, _task: &Task, max_file_size: u64) -> u64 {
        max_file_size.saturating_mul(3)
    }

    async fn process(&self, ctx: &TaskContext<'_>) -> Result<u64> {
        let TaskParams::Caption(params) = &ctx.task.params else {
            return Err(params_mismatch(ctx.task, TaskType::Caption));
        };
        let task_id = &ctx.task.id;

        let video_path = ctx.workspace.join("input.mp4");
        info!("[{}] Downloading video from {}", task_id, params.video_url);
        let download = ctx.fetcher.fetch(&params.video_url, &video_path).await?;

        info!("[{}] Transcribing with model {}", task_id, params.model_size);
        let segments = self.speech.transcribe(&video_path, params.model_size).await?;
        info!("[{}] Transcription complete, found {} segments", task_id, segments.len());
        if segments.is_empty() {
            warn!("[{}] No speech detected, output will have no subtitles", task_id);
        }

        let srt = build_srt(&segments, DEFAULT_MAX_WORDS_PER_LINE);
        info!("[{}] Burning subtitles", task_id);
        self.media.burn_subtitles(&video_path, &srt, ctx.output_path).await?;

        Ok(download.bytes)
    }
}
