use std::path::Path;

use async_trait::async_trait;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::debug;

use crate::config::AudioSection;

use super::error::{MediaError, MediaResult};
use super::types::{TaskWorkspace, WorkUnit};

/// Splits a raw audio track into ordered work units.
#[async_trait]
pub trait AudioSegmenter: Send + Sync {
    async fn segment(&self, raw_audio: &Path, workspace: &TaskWorkspace)
        -> MediaResult<Vec<WorkUnit>>;
}

/// Fixed-length windows; windows quieter than the threshold are dropped.
#[derive(Debug, Clone)]
pub struct EnergySegmenter {
    window_ms: u64,
    silence_threshold_dbfs: f64,
}

impl EnergySegmenter {
    pub fn new(config: &AudioSection) -> Self {
        Self {
            window_ms: config.window_ms.max(1),
            silence_threshold_dbfs: config.silence_threshold_dbfs,
        }
    }
}

#[async_trait]
impl AudioSegmenter for EnergySegmenter {
    async fn segment(
        &self,
        raw_audio: &Path,
        workspace: &TaskWorkspace,
    ) -> MediaResult<Vec<WorkUnit>> {
        let segmenter = self.clone();
        let raw_audio = raw_audio.to_path_buf();
        let workspace = workspace.clone();
        tokio::task::spawn_blocking(move || segmenter.segment_blocking(&raw_audio, &workspace))
            .await
            .map_err(|err| MediaError::Segmentation(format!("segmentation task failed: {err}")))?
    }
}

impl EnergySegmenter {
    fn segment_blocking(&self, raw_audio: &Path, workspace: &TaskWorkspace) -> MediaResult<Vec<WorkUnit>> {
        let (samples, sample_rate) = read_mono(raw_audio)?;
        if sample_rate == 0 {
            return Err(MediaError::Segmentation("audio reports zero sample rate".into()));
        }
        let duration_ms = samples.len() as u64 * 1000 / sample_rate as u64;
        let window_len = ((self.window_ms * sample_rate as u64) / 1000).max(1) as usize;

        let mut units = Vec::new();
        for (index, window) in samples.chunks(window_len).enumerate() {
            if rms_dbfs(window) < self.silence_threshold_dbfs {
                continue;
            }
            let start_offset_ms = index as u64 * self.window_ms;
            let end_offset_ms = (start_offset_ms + self.window_ms).min(duration_ms);
            let path = workspace.chunk_path(index);
            write_chunk(&path, window, sample_rate)?;
            units.push(WorkUnit {
                path,
                start_offset_ms,
                end_offset_ms,
            });
        }
        debug!(
            audio = %raw_audio.display(),
            duration_ms,
            units = units.len(),
            "audio segmented"
        );
        Ok(units)
    }
}

fn read_mono(path: &Path) -> MediaResult<(Vec<f32>, u32)> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let max_val = (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|s| s as f32 / max_val))
                .collect::<Result<_, _>>()?
        }
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
    };
    let channels = spec.channels.max(1) as usize;
    let mono = if channels == 1 {
        samples
    } else {
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };
    Ok((mono, spec.sample_rate))
}

fn rms_dbfs(window: &[f32]) -> f64 {
    if window.is_empty() {
        return f64::NEG_INFINITY;
    }
    let mean_square =
        window.iter().map(|s| (*s as f64) * (*s as f64)).sum::<f64>() / window.len() as f64;
    if mean_square <= 0.0 {
        f64::NEG_INFINITY
    } else {
        10.0 * mean_square.log10()
    }
}

fn write_chunk(path: &Path, window: &[f32], sample_rate: u32) -> MediaResult<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for sample in window {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(value)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn write_test_wav(path: &Path, sample_rate: u32, segments: &[(u64, f32)]) {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    for (duration_ms, amplitude) in segments {
        let count = duration_ms * sample_rate as u64 / 1000;
        for i in 0..count {
            let phase = (i as f32 / sample_rate as f32) * 440.0 * std::f32::consts::TAU;
            let value = (phase.sin() * amplitude * i16::MAX as f32) as i16;
            writer.write_sample(value).unwrap();
        }
    }
    writer.finalize().unwrap();
}
