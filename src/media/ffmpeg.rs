use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::{MediaEngine, MusicMix, ResizeMode, SceneMix};

/// Duration used when ffprobe cannot read the input.
const FALLBACK_DURATION_SECS: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct SubtitleStyle {
    pub font_family: String,
    pub font_size: u32,
    pub word_color: String,
    pub outline_color: String,
    pub shadow_color: String,
    pub outline_width: u32,
    pub shadow_offset: u32,
    /// Vertical baseline, measured from the top of a 1920px frame.
    pub y: u32,
}

impl Default for SubtitleStyle {
    fn default() -> Self {
        Self {
            font_family: "Nunito".to_string(),
            font_size: 80,
            word_color: "#FFFFFF".to_string(),
            outline_color: "#000000".to_string(),
            shadow_color: "#000000".to_string(),
            outline_width: 3,
            shadow_offset: 2,
            y: 1400,
        }
    }
}

/// `#RRGGBB` to the ASS colour form `&H00BBGGRR`, white when malformed.
fn hex_to_ass_color(hex: &str) -> String {
    let hex = hex.trim_start_matches('#');
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return "&H00FFFFFF".to_string();
    }
    let (r, g, b) = (&hex[0..2], &hex[2..4], &hex[4..6]);
    format!("&H00{}{}{}", b, g, r).to_uppercase()
}

fn subtitle_filter(srt_path: &Path, style: &SubtitleStyle) -> String {
    let escaped = srt_path.to_string_lossy().replace('\\', "/").replace(':', "\\:");
    format!(
        "subtitles={}:force_style='FontName={},FontSize={},PrimaryColour={},OutlineColour={},BackColour={},\
         BorderStyle=1,Outline={},Shadow={},Alignment=2,MarginV={}'",
        escaped,
        style.font_family,
        style.font_size,
        hex_to_ass_color(&style.word_color),
        hex_to_ass_color(&style.outline_color),
        hex_to_ass_color(&style.shadow_color),
        style.outline_width,
        style.shadow_offset,
        1920u32.saturating_sub(style.y)
    )
}

fn scene_filter(scene: &SceneMix) -> String {
    let (w, h) = (scene.width, scene.height);
    let scale = match scene.resize_mode {
        ResizeMode::Cover => format!("[0:v]scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}[v]"),
        ResizeMode::Contain => {
            format!("[0:v]scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2[v]")
        }
    };
    format!(
        "{};[0:a]volume={}[va];[1:a]volume={},atrim=duration={},asetpts=PTS-STARTPTS[aa];[va][aa]amix=inputs=2:duration=first[a]",
        scale, scene.video_volume, scene.audio_volume, scene.duration_secs
    )
}

fn music_filter(mix: &MusicMix, duration_secs: f64) -> String {
    format!(
        "[0:a]volume={}[va];[1:a]volume={},aloop=loop=-1:size=2e+09,atrim=duration={}[ma];\
         [va][ma]amix=inputs=2:duration=first:dropout_transition=2[a]",
        mix.video_volume, mix.music_volume, duration_secs
    )
}

/// Concat demuxer list, one `file '...'` line per clip.
fn concat_list(clips: &[PathBuf]) -> String {
    clips
        .iter()
        .map(|clip| {
            let escaped = clip.to_string_lossy().replace('\\', "/").replace('\'', "'\\''");
            format!("file '{}'\n", escaped)
        })
        .collect()
}

/// The demuxer list lives beside the clips, inside the task workspace, so it
/// never lands in the output directory.
fn concat_list_path(clips: &[PathBuf]) -> Option<PathBuf> {
    clips.first().map(|first| first.with_file_name("concat.txt"))
}

/// Runs the `ffmpeg` and `ffprobe` binaries found on `PATH`.
#[derive(Debug, Clone, Default)]
pub struct FfmpegEngine {
    style: SubtitleStyle,
}

impl FfmpegEngine {
    pub fn new() -> Self {
        Self::default()
    }

    async fn run(&self, program: &str, args: Vec<OsString>) -> Result<String> {
        let output = Command::new(program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to execute {}: {}", program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // ffmpeg prints its banner first; the cause is at the end
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(anyhow::anyhow!("{} exited with {}: {}", program, output.status, tail.join(" | ")));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn probe_duration(&self, path: &Path) -> f64 {
        let args = vec![
            "-v".into(),
            "error".into(),
            "-show_entries".into(),
            "format=duration".into(),
            "-of".into(),
            "default=noprint_wrappers=1:nokey=1".into(),
            path.as_os_str().to_owned(),
        ];
        match self.run("ffprobe", args).await {
            Ok(stdout) => match stdout.trim().parse::<f64>() {
                Ok(duration) => duration,
                Err(e) => {
                    warn!("Could not parse duration for {}: {}", path.display(), e);
                    FALLBACK_DURATION_SECS
                }
            },
            Err(e) => {
                warn!("Could not get duration for {}: {}", path.display(), e);
                FALLBACK_DURATION_SECS
            }
        }
    }
}

#[async_trait]
impl MediaEngine for FfmpegEngine {
    async fn burn_subtitles(&self, video_path: &Path, srt_text: &str, output: &Path) -> Result<()> {
        let srt_path = video_path.with_extension("srt");
        tokio::fs::write(&srt_path, srt_text).await?;

        info!("Burning subtitles into {}", video_path.display());
        let args = vec![
            "-y".into(),
            "-i".into(),
            video_path.as_os_str().to_owned(),
            "-vf".into(),
            subtitle_filter(&srt_path, &self.style).into(),
            "-c:a".into(),
            "copy".into(),
            output.as_os_str().to_owned(),
        ];
        let result = self.run("ffmpeg", args).await;

        if let Err(e) = tokio::fs::remove_file(&srt_path).await {
            warn!("Failed to remove subtitle file {}: {}", srt_path.display(), e);
        }
        result.map(|_| ())
    }

    async fn merge_scene(&self, scene: &SceneMix, output: &Path) -> Result<()> {
        info!("Merging {} with {}", scene.video_path.display(), scene.audio_path.display());
        let mut args: Vec<OsString> = vec![
            "-y".into(),
            "-i".into(),
            scene.video_path.as_os_str().to_owned(),
            "-i".into(),
            scene.audio_path.as_os_str().to_owned(),
            "-t".into(),
            scene.duration_secs.to_string().into(),
            "-filter_complex".into(),
            scene_filter(scene).into(),
        ];
        args.extend(
            [
                "-map", "[v]", "-map", "[a]", "-c:v", "libx264", "-preset", "medium", "-crf", "23", "-c:a", "aac",
                "-b:a", "128k", "-ar", "48000", "-ac", "2",
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(output.as_os_str().to_owned());

        self.run("ffmpeg", args).await.map(|_| ())
    }

    async fn concat(&self, clips: &[PathBuf], output: &Path) -> Result<()> {
        let Some(list_path) = concat_list_path(clips) else {
            return Err(anyhow::anyhow!("Nothing to concatenate"));
        };
        tokio::fs::write(&list_path, concat_list(clips)).await?;

        info!("Concatenating {} clips into {}", clips.len(), output.display());
        let args = vec![
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.as_os_str().to_owned(),
            "-c".into(),
            "copy".into(),
            output.as_os_str().to_owned(),
        ];
        let result = self.run("ffmpeg", args).await;

        if let Err(e) = tokio::fs::remove_file(&list_path).await {
            warn!("Failed to remove concat list {}: {}", list_path.display(), e);
        }
        result.map(|_| ())
    }

    async fn add_background_music(&self, mix: &MusicMix, output: &Path) -> Result<()> {
        let duration = self.probe_duration(&mix.video_path).await;
        info!("Adding background music to {} ({}s)", mix.video_path.display(), duration);

        let mut args: Vec<OsString> = vec![
            "-y".into(),
            "-i".into(),
            mix.video_path.as_os_str().to_owned(),
            "-i".into(),
            mix.music_path.as_os_str().to_owned(),
            "-filter_complex".into(),
            music_filter(mix, duration).into(),
        ];
        args.extend(
            [
                "-map", "0:v", "-map", "[a]", "-c:v", "copy", "-c:a", "aac", "-b:a", "192k", "-ar", "48000",
                "-shortest",
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(output.as_os_str().to_owned());

        self.run("ffmpeg", args).await.map(|_| ())
    }
}
