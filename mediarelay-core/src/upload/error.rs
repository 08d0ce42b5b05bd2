use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("storage backend rejected upload (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("route selection failed: {0}")]
    Route(String),
    #[error("upload stalled: nothing moved for {after:?}")]
    Stalled { after: Duration },
}

impl From<reqwest::Error> for UploadError {
    fn from(error: reqwest::Error) -> Self {
        UploadError::Network(error.to_string())
    }
}

pub type UploadResult<T> = Result<T, UploadError>;
