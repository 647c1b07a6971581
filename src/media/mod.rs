use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod ffmpeg;
pub mod subtitle;

pub use ffmpeg::FfmpegEngine;

/// How a clip is fitted into the output frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    /// Scale up and crop to fill the frame.
    #[default]
    Cover,
    /// Scale down and pad to fit inside the frame.
    Contain,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneMix {
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
    pub video_volume: f32,
    pub audio_volume: f32,
    pub duration_secs: f32,
    pub width: u32,
    pub height: u32,
    pub resize_mode: ResizeMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MusicMix {
    pub video_path: PathBuf,
    pub music_path: PathBuf,
    pub music_volume: f32,
    pub video_volume: f32,
}

/// The external transformation tool. Every call either produces `output` or fails.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn burn_subtitles(&self, video_path: &Path, srt_text: &str, output: &Path) -> Result<()>;
    async fn merge_scene(&self, scene: &SceneMix, output: &Path) -> Result<()>;
    async fn concat(&self, clips: &[PathBuf], output: &Path) -> Result<()>;
    async fn add_background_music(&self, mix: &MusicMix, output: &Path) -> Result<()>;
}
