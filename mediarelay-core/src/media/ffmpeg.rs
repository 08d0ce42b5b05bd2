use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::AudioSection;

use super::error::{MediaError, MediaResult};
use super::types::TaskWorkspace;

/// Produces a raw audio track from a downloaded source.
#[async_trait]
pub trait AudioExtractor: Send + Sync {
    async fn extract(&self, source: &Path, workspace: &TaskWorkspace) -> MediaResult<PathBuf>;
}

/// Mono PCM WAV extraction through the `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct FfmpegAudioExtractor {
    binary: PathBuf,
    sample_rate: u32,
}

impl FfmpegAudioExtractor {
    pub fn new(config: &AudioSection) -> Self {
        Self {
            binary: PathBuf::from(&config.ffmpeg_path),
            sample_rate: config.sample_rate,
        }
    }
}

#[async_trait]
impl AudioExtractor for FfmpegAudioExtractor {
    async fn extract(&self, source: &Path, workspace: &TaskWorkspace) -> MediaResult<PathBuf> {
        let output_path = workspace.raw_audio_path();
        let mut command = Command::new(&self.binary);
        command
            .kill_on_drop(true)
            .arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(source)
            .arg("-vn")
            .arg("-ac")
            .arg("1")
            .arg("-ar")
            .arg(self.sample_rate.to_string())
            .arg("-acodec")
            .arg("pcm_s16le")
            .arg(&output_path);
        let output = command
            .output()
            .await
            .map_err(|err| MediaError::Extraction(format!("failed to run ffmpeg: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MediaError::Extraction(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        debug!(source = %source.display(), audio = %output_path.display(), "audio track extracted");
        Ok(output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixture_config;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_binary_is_an_extraction_error() {
        let dir = TempDir::new().unwrap();
        let mut audio = fixture_config().audio;
        audio.ffmpeg_path = dir.path().join("no-such-ffmpeg").display().to_string();
        let extractor = FfmpegAudioExtractor::new(&audio);
        let workspace = TaskWorkspace::new(dir.path(), "t");
        workspace.prepare().await.unwrap();

        let err = extractor
            .extract(&dir.path().join("clip.mp4"), &workspace)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Extraction(_)));
    }
}
