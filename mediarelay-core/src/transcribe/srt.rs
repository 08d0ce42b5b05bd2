use super::TranscriptLine;

/// `HH:MM:SS,mmm`
pub fn format_timestamp(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let millis = ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02},{millis:03}")
}

/// Numbered SRT document; lines are expected in start order.
pub fn render_srt(lines: &[TranscriptLine]) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(index, line)| {
            format!(
                "{}\n{} --> {}\n{}\n",
                index + 1,
                format_timestamp(line.start_ms),
                format_timestamp(line.end_ms),
                line.text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
