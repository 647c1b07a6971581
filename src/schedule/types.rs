use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::asr::ModelSize;
use crate::media::ResizeMode;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Caption,
    Merge,
    BackgroundMusic,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [TaskType::Caption, TaskType::Merge, TaskType::BackgroundMusic];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Caption => "caption",
            TaskType::Merge => "merge",
            TaskType::BackgroundMusic => "background_music",
        }
    }

    /// Human-facing name used in failure messages.
    pub fn label(&self) -> &'static str {
        match self {
            TaskType::Caption => "Caption",
            TaskType::Merge => "Merge",
            TaskType::BackgroundMusic => "Background music",
        }
    }

    /// Suffix of the output file, `{task_id}_{suffix}.mp4`.
    pub fn output_suffix(&self) -> &'static str {
        match self {
            TaskType::Caption => "captioned",
            TaskType::Merge => "merged",
            TaskType::BackgroundMusic => "with_music",
        }
    }

    /// Prefix of the per-task working directory under the temp root.
    pub fn workspace_prefix(&self) -> &'static str {
        match self {
            TaskType::Caption => "caption_",
            TaskType::Merge => "merge_",
            TaskType::BackgroundMusic => "music_",
        }
    }

    pub fn output_filename(&self, task_id: &str) -> String {
        format!("{}_{}.mp4", task_id, self.output_suffix())
    }

    /// The type whose output file is named `name`, if `name` is a plain
    /// `{task_id}_{suffix}.mp4` with no path components.
    pub fn from_output_filename(name: &str) -> Option<TaskType> {
        let stem = name.strip_suffix(".mp4")?;
        TaskType::ALL.into_iter().find(|task_type| {
            stem.strip_suffix(task_type.output_suffix())
                .and_then(|rest| rest.strip_suffix('_'))
                .is_some_and(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
        })
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "caption" => Ok(TaskType::Caption),
            "merge" => Ok(TaskType::Merge),
            "background_music" => Ok(TaskType::BackgroundMusic),
            _ => Err(format!("Unknown task type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    /// QUEUED -> RUNNING -> {SUCCESS | FAILED}. Nothing leaves a terminal state.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Success)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    /// Statuses a row may hold for a transition into `self` to be legal.
    pub fn predecessors(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Queued => &[],
            TaskStatus::Running => &[TaskStatus::Queued],
            TaskStatus::Success => &[TaskStatus::Running],
            TaskStatus::Failed => &[TaskStatus::Running],
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = String;
    fn try_from(status: String) -> Result<Self, Self::Error> {
        match status.as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("Invalid task status: {}", status)),
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum TaskParams {
    Caption(CaptionParams),
    Merge(MergeParams),
    BackgroundMusic(BackgroundMusicParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionParams {
    pub video_url: String,
    #[serde(default)]
    pub model_size: ModelSize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeParams {
    pub scene_clip_urls: Vec<String>,
    pub voiceover_urls: Vec<String>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_merge_video_volume")]
    pub video_volume: f32,
    #[serde(default = "default_voiceover_volume")]
    pub voiceover_volume: f32,
    #[serde(default)]
    pub resize_mode: ResizeMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundMusicParams {
    pub video_url: String,
    pub music_url: String,
    #[serde(default = "default_music_volume")]
    pub music_volume: f32,
    #[serde(default = "default_music_video_volume")]
    pub video_volume: f32,
}

fn default_width() -> u32 {
    1080
}

fn default_height() -> u32 {
    1920
}

fn default_merge_video_volume() -> f32 {
    0.2
}

fn default_voiceover_volume() -> f32 {
    2.0
}

fn default_music_volume() -> f32 {
    0.3
}

fn default_music_video_volume() -> f32 {
    1.0
}

const DIMENSION_RANGE: std::ops::RangeInclusive<u32> = 480..=3840;

fn check_volume(name: &str, value: f32, max: f32) -> anyhow::Result<()> {
    if !(0.0..=max).contains(&value) {
        return Err(anyhow::anyhow!("{} must be between 0 and {}, got {}", name, max, value));
    }
    Ok(())
}

fn check_url(name: &str, url: &str) -> anyhow::Result<()> {
    let parsed = reqwest::Url::parse(url).map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(anyhow::anyhow!("Invalid {}: unsupported scheme {}", name, parsed.scheme()));
    }
    Ok(())
}

impl TaskParams {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskParams::Caption(_) => TaskType::Caption,
            TaskParams::Merge(_) => TaskType::Merge,
            TaskParams::BackgroundMusic(_) => TaskType::BackgroundMusic,
        }
    }

    /// The input recorded as the task's primary reference.
    pub fn primary_input(&self) -> &str {
        match self {
            TaskParams::Caption(p) => &p.video_url,
            TaskParams::Merge(p) => p.scene_clip_urls.first().map(String::as_str).unwrap_or_default(),
            TaskParams::BackgroundMusic(p) => &p.video_url,
        }
    }

    /// Every URL the task downloads, in download order.
    pub fn input_urls(&self) -> Vec<&str> {
        match self {
            TaskParams::Caption(p) => vec![p.video_url.as_str()],
            TaskParams::Merge(p) => p
                .scene_clip_urls
                .iter()
                .zip(&p.voiceover_urls)
                .flat_map(|(scene, voice)| [scene.as_str(), voice.as_str()])
                .collect(),
            TaskParams::BackgroundMusic(p) => vec![p.video_url.as_str(), p.music_url.as_str()],
        }
    }

    /// Largest combined input size accepted at submission, as a multiple of
    /// the per-file limit.
    pub fn total_size_factor(&self) -> u64 {
        match self {
            TaskParams::Caption(_) => 1,
            TaskParams::Merge(_) => 5,
            TaskParams::BackgroundMusic(_) => 2,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            TaskParams::Caption(p) => check_url("video_url", &p.video_url),
            TaskParams::Merge(p) => {
                if p.scene_clip_urls.is_empty() || p.voiceover_urls.is_empty() {
                    return Err(anyhow::anyhow!("scene_clip_urls and voiceover_urls must not be empty"));
                }
                if p.scene_clip_urls.len() != p.voiceover_urls.len() {
                    return Err(anyhow::anyhow!(
                        "Got {} scene clips but {} voiceovers",
                        p.scene_clip_urls.len(),
                        p.voiceover_urls.len()
                    ));
                }
                for url in &p.scene_clip_urls {
                    check_url("scene_clip_url", url)?;
                }
                for url in &p.voiceover_urls {
                    check_url("voiceover_url", url)?;
                }
                if !DIMENSION_RANGE.contains(&p.width) || !DIMENSION_RANGE.contains(&p.height) {
                    return Err(anyhow::anyhow!(
                        "Output size {}x{} outside of {:?}",
                        p.width,
                        p.height,
                        DIMENSION_RANGE
                    ));
                }
                check_volume("video_volume", p.video_volume, 1.0)?;
                check_volume("voiceover_volume", p.voiceover_volume, 10.0)
            }
            TaskParams::BackgroundMusic(p) => {
                check_url("video_url", &p.video_url)?;
                check_url("music_url", &p.music_url)?;
                check_volume("music_volume", p.music_volume, 1.0)?;
                check_volume("video_volume", p.video_volume, 1.0)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub input_ref: String,
    pub params: TaskParams,
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub file_size: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(params: TaskParams) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: params.task_type(),
            status: TaskStatus::Queued,
            input_ref: params.primary_input().to_string(),
            params,
            result_ref: None,
            error: None,
            file_size: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn output_filename(&self) -> String {
        self.task_type.output_filename(&self.id)
    }
}

/// A status change as written to the record store.
///
/// Each variant carries exactly the fields its target status requires, so a
/// SUCCESS row always has a result reference and a FAILED row an error.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Running,
    Success { result_ref: String, file_size: u64 },
    Failed { error: String },
}

impl StatusUpdate {
    pub fn status(&self) -> TaskStatus {
        match self {
            StatusUpdate::Running => TaskStatus::Running,
            StatusUpdate::Success { .. } => TaskStatus::Success,
            StatusUpdate::Failed { .. } => TaskStatus::Failed,
        }
    }
}
