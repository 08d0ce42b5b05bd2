mod error;
mod gemini;
mod scheduler;
mod srt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::media::WorkUnit;

pub use error::{SchedulerError, TranscribeError, TranscribeResult};
pub use gemini::{GeminiTranscriber, Prompts};
pub use scheduler::{BatchScheduler, SchedulerSettings, TranscriptOutcome};
pub use srt::{format_timestamp, render_srt};

/// One batch of work units sent in a single call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionRequest {
    pub batch_index: usize,
    pub units: Vec<WorkUnit>,
    pub api_key: Option<String>,
}

/// Line as returned by the transcription service; `end_ms` may be open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLine {
    pub start_ms: u64,
    #[serde(default)]
    pub end_ms: Option<u64>,
    pub text: String,
}

/// Line with resolved absolute offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptLine {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Called once per task before its batches are submitted.
    async fn prepare(&self) {}

    async fn transcribe(&self, request: &TranscriptionRequest) -> TranscribeResult<Vec<RawLine>>;
}
