use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tracing::info;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::asr::{ModelSize, SpeechEngine, TranscribeSegment};
use crate::audio;

/// Whisper-backed speech engine.
///
/// Models are loaded on first use per size and the handle is shared by every
/// caption task afterwards.
pub struct WhisperAsr {
    model_dir: PathBuf,
    contexts: Mutex<HashMap<ModelSize, Arc<OnceCell<Arc<WhisperContext>>>>>,
}

impl WhisperAsr {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn model_path(&self, size: ModelSize) -> PathBuf {
        self.model_dir.join(size.model_file_name())
    }

    async fn context(&self, size: ModelSize) -> Result<Arc<WhisperContext>> {
        // the map lock is only held to find the slot; loads of different
        // sizes proceed independently
        let slot = self.contexts.lock().await.entry(size).or_default().clone();
        let ctx = slot.get_or_try_init(|| self.load(size)).await?;
        Ok(ctx.clone())
    }

    async fn load(&self, size: ModelSize) -> Result<Arc<WhisperContext>> {
        let model_path = self.model_path(size);
        if !model_path.exists() {
            return Err(anyhow::anyhow!("whisper model not found: {}", model_path.display()));
        }

        info!("Loading whisper model {} from {}", size, model_path.display());
        let path = model_path.to_string_lossy().to_string();
        let ctx = tokio::task::spawn_blocking(move || {
            WhisperContext::new_with_params(&path, WhisperContextParameters::default())
                .map_err(|e| anyhow::anyhow!("failed to open whisper model: {}", e))
        })
        .await??;

        Ok(Arc::new(ctx))
    }

    fn build_params<'a, 'b>() -> FullParams<'a, 'b> {
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

        // lower temperature keeps the output deterministic
        params.set_temperature(0.0);
        params.set_n_threads(num_threads());
        params.set_translate(false);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_no_context(false);
        params.set_single_segment(false);
        params.set_suppress_blank(true);
        params.set_suppress_non_speech_tokens(true);

        params
    }
}

fn num_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get().min(8) as i32)
        .unwrap_or(4)
}

#[async_trait]
impl SpeechEngine for WhisperAsr {
    async fn transcribe(&self, media_path: &Path, model_size: ModelSize) -> Result<Vec<TranscribeSegment>> {
        let ctx = self.context(model_size).await?;
        let audio = audio::load_pcm_16k(media_path).await?;

        tokio::task::spawn_blocking(move || -> Result<Vec<TranscribeSegment>> {
            let mut state = ctx.create_state()?;
            state.full(Self::build_params(), &audio)?;

            let num_segments = state.full_n_segments()?;
            let mut segments = Vec::with_capacity(num_segments.max(0) as usize);
            for i in 0..num_segments {
                let text = state.full_get_segment_text(i)?;
                // whisper reports timestamps in centiseconds
                let start = state.full_get_segment_t0(i)? as f64 / 100.0;
                let end = state.full_get_segment_t1(i)? as f64 / 100.0;
                segments.push(TranscribeSegment { start, end, text });
            }
            Ok(segments)
        })
        .await?
    }
}
