use std::path::{Path, PathBuf};

use anyhow::Result;
use hound::{SampleFormat, WavReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Sample rate expected by the speech engine.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Decode an audio or video file into mono 16 kHz samples in `[-1, 1]`.
///
/// The input is first transcoded by ffmpeg into a temporary 16-bit PCM WAV
/// next to it (`{stem}_pcm16k.wav`), which is read back and removed.
///
/// # Arguments
/// * `path` - any container ffmpeg can demux; only the first audio stream is used
///
/// # Returns
/// * `Vec<f32>` - mono samples at [`TARGET_SAMPLE_RATE`]
pub async fn load_pcm_16k(path: &Path) -> Result<Vec<f32>> {
    let wav_path = wav_path_for(path);
    transcode_to_wav(path, &wav_path).await?;

    let read_path = wav_path.clone();
    let samples = tokio::task::spawn_blocking(move || read_wav_file(&read_path)).await?;

    if let Err(e) = tokio::fs::remove_file(&wav_path).await {
        warn!("Failed to remove temporary WAV file {}: {}", wav_path.display(), e);
    }

    let (samples, num_channels, sample_rate) = samples?;
    if sample_rate != TARGET_SAMPLE_RATE {
        return Err(anyhow::anyhow!(
            "Unexpected sample rate {} Hz after transcoding, expected {} Hz",
            sample_rate,
            TARGET_SAMPLE_RATE
        ));
    }

    Ok(convert_to_mono(&samples, num_channels))
}

fn wav_path_for(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("audio");
    path.with_file_name(format!("{}_pcm16k.wav", stem))
}

/// Transcode the first audio stream to 16 kHz mono PCM with ffmpeg.
async fn transcode_to_wav(input: &Path, output: &Path) -> Result<()> {
    info!("Extracting audio from {}", input.display());

    let result = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .args(["-vn", "-acodec", "pcm_s16le", "-ac", "1", "-ar"])
        .arg(TARGET_SAMPLE_RATE.to_string())
        .arg(output)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to execute ffmpeg: {}", e))?;

    if !result.status.success() {
        return Err(anyhow::anyhow!(
            "FFmpeg audio extraction failed with status {}: {}",
            result.status,
            String::from_utf8_lossy(&result.stderr).trim()
        ));
    }

    Ok(())
}

/// Read a 16-bit integer WAV file.
///
/// Returns the interleaved samples scaled to `[-1, 1]`, the channel count and
/// the sample rate.
fn read_wav_file(path: &Path) -> Result<(Vec<f32>, usize, u32)> {
    let mut reader = WavReader::open(path).map_err(|e| anyhow::anyhow!("Failed to read WAV file: {}", e))?;

    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int {
        return Err(anyhow::anyhow!("Unsupported sample format: expected integer format"));
    }
    if spec.bits_per_sample != 16 {
        return Err(anyhow::anyhow!("Unsupported bits per sample: expected 16 bits"));
    }

    let samples: Vec<f32> = reader
        .samples::<i16>()
        .map(|s| s.map(|val| val as f32 / i16::MAX as f32))
        .collect::<std::result::Result<Vec<f32>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to read samples: {}", e))?;

    Ok((samples, spec.channels as usize, spec.sample_rate))
}

/// Average interleaved channels into a single channel.
fn convert_to_mono(samples: &[f32], num_channels: usize) -> Vec<f32> {
    if num_channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(num_channels)
        .map(|chunk| chunk.iter().sum::<f32>() / num_channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    #[test]
    fn stereo_is_averaged_to_mono() {
        let mono = convert_to_mono(&[0.5, -0.5, 1.0, 0.0], 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn wav_path_is_derived_from_stem() {
        assert_eq!(wav_path_for(Path::new("/tmp/x/input.mp4")), PathBuf::from("/tmp/x/input_pcm16k.wav"));
    }

    #[test]
    fn reads_16_bit_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: TARGET_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        writer.write_sample(i16::MAX).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();

        let (samples, channels, rate) = read_wav_file(&path).unwrap();
        assert_eq!((channels, rate), (1, TARGET_SAMPLE_RATE));
        assert_eq!(samples, vec![1.0, 0.0]);
    }
}
