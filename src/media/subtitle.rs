use crate::asr::TranscribeSegment;

pub const DEFAULT_MAX_WORDS_PER_LINE: usize = 3;

/// Format seconds as an SRT timestamp, `HH:MM:SS,mmm`.
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).floor() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

/// Build SRT text from transcript segments.
///
/// Segments longer than `max_words_per_line` words are split into several cues
/// that share the segment's duration evenly.
pub fn build_srt(segments: &[TranscribeSegment], max_words_per_line: usize) -> String {
    let max_words = max_words_per_line.max(1);
    let mut cues = Vec::new();
    let mut counter = 1;

    for segment in segments {
        let text = segment.text.trim();
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }

        let chunks: Vec<String> = if words.len() <= max_words {
            vec![text.to_string()]
        } else {
            words.chunks(max_words).map(|chunk| chunk.join(" ")).collect()
        };

        let chunk_duration = (segment.end - segment.start) / chunks.len() as f64;
        for (idx, chunk) in chunks.iter().enumerate() {
            let start = segment.start + idx as f64 * chunk_duration;
            let end = segment.start + (idx + 1) as f64 * chunk_duration;
            cues.push(format!(
                "{}\n{} --> {}\n{}\n",
                counter,
                format_timestamp(start),
                format_timestamp(end),
                chunk
            ));
            counter += 1;
        }
    }

    cues.join("\n")
}
