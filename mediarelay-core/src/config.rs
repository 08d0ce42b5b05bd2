use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

pub const API_KEYS_ENV: &str = "MEDIARELAY_API_KEYS";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    pub paths: PathsSection,
    pub workers: WorkersSection,
    pub download: DownloadSection,
    pub audio: AudioSection,
    pub transcription: TranscriptionSection,
    pub upload: UploadSection,
    pub registry: RegistrySection,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let t = &self.transcription;
        if t.batch_size == 0 {
            return Err(invalid("transcription.batch_size", "must be greater than zero"));
        }
        if t.concurrency_limit == 0 {
            return Err(invalid(
                "transcription.concurrency_limit",
                "must be greater than zero",
            ));
        }
        if t.requests_per_minute <= 0.0 {
            return Err(invalid(
                "transcription.requests_per_minute",
                "must be positive",
            ));
        }
        if t.retry_limit == 0 {
            return Err(invalid("transcription.retry_limit", "must be greater than zero"));
        }
        if !(1..=100).contains(&self.upload.report_step_percent) {
            return Err(invalid(
                "upload.report_step_percent",
                "must be between 1 and 100",
            ));
        }
        if self.workers.media_workers == 0 {
            return Err(invalid("workers.media_workers", "must be greater than zero"));
        }
        if self.download.read_timeout_seconds == 0 {
            return Err(invalid("download.read_timeout_seconds", "must be greater than zero"));
        }
        if self.upload.stall_timeout_seconds == 0 {
            return Err(invalid("upload.stall_timeout_seconds", "must be greater than zero"));
        }
        if self.audio.window_ms == 0 {
            return Err(invalid("audio.window_ms", "must be greater than zero"));
        }
        Ok(())
    }

    /// Replaces the configured API keys with the comma-separated list in
    /// `MEDIARELAY_API_KEYS`, when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(API_KEYS_ENV) {
            let keys: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(String::from)
                .collect();
            if !keys.is_empty() {
                self.transcription.api_keys = keys;
            }
        }
    }

    pub fn work_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.work_dir)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub work_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersSection {
    pub media_workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSection {
    pub user_agent: String,
    pub connect_timeout_seconds: u64,
    /// Longest wait for the next body chunk before the download is abandoned.
    pub read_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioSection {
    pub ffmpeg_path: String,
    pub sample_rate: u32,
    pub window_ms: u64,
    pub silence_threshold_dbfs: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionSection {
    pub endpoint_prefix: String,
    pub model: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Optional endpoint serving `{system_instruction, prompt_for_task}`.
    #[serde(default)]
    pub prompt_url: Option<String>,
    pub prompt: String,
    pub system_instruction: String,
    pub batch_size: usize,
    pub concurrency_limit: usize,
    pub requests_per_minute: f64,
    pub retry_limit: u32,
    pub backoff_base_ms: u64,
    pub batch_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub min_line_duration_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadSection {
    pub base_url: String,
    pub proxy: Option<String>,
    pub report_step_percent: u32,
    pub chunk_size_bytes: usize,
    pub connect_timeout_seconds: u64,
    /// An upload with no bytes moving (or no reply) for this long is abandoned.
    pub stall_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    pub stale_after_minutes: u64,
    pub retention_minutes: u64,
    pub sweep_interval_seconds: u64,
}

impl RegistrySection {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_after_minutes as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.retention_minutes as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

pub fn load_engine_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig> {
    let mut config: EngineConfig = load_toml(path)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
pub(crate) fn fixture_config() -> EngineConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/mediarelay.toml");
    let content = std::fs::read_to_string(path).expect("fixture config readable");
    toml::from_str(&content).expect("fixture config parses")
}
