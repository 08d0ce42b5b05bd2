use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("network error: {0}")]
    Network(String),
    #[error("transcription endpoint returned HTTP {code}")]
    Status { code: u16 },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("response failed validation: {0}")]
    Validation(String),
    #[error("content blocked: {0}")]
    ContentBlocked(String),
    #[error("batch {index} has no readable audio")]
    EmptyBatch { index: usize },
    #[error("no credential available for batch {index}")]
    MissingCredential { index: usize },
}

impl TranscribeError {
    /// Failure classes worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TranscribeError::Network(_)
            | TranscribeError::Malformed(_)
            | TranscribeError::Validation(_) => true,
            TranscribeError::Status { code } => matches!(code, 429 | 500 | 503 | 504),
            TranscribeError::ContentBlocked(_)
            | TranscribeError::EmptyBatch { .. }
            | TranscribeError::MissingCredential { .. } => false,
        }
    }
}

impl From<reqwest::Error> for TranscribeError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => TranscribeError::Status {
                code: status.as_u16(),
            },
            None if error.is_decode() => TranscribeError::Malformed(error.to_string()),
            None => TranscribeError::Network(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for TranscribeError {
    fn from(error: serde_json::Error) -> Self {
        TranscribeError::Malformed(error.to_string())
    }
}

pub type TranscribeResult<T> = Result<T, TranscribeError>;

/// Why a single batch produced no lines.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("batch {index} failed: {source}")]
    Batch {
        index: usize,
        #[source]
        source: TranscribeError,
    },
    #[error("batch {index} timed out after {after:?}")]
    TimedOut { index: usize, after: Duration },
    #[error("batch {index} panicked: {message}")]
    Panicked { index: usize, message: String },
    #[error("batch task aborted: {0}")]
    Join(String),
}
