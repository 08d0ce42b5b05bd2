use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("audio extraction failed: {0}")]
    Extraction(String),
    #[error("audio segmentation failed: {0}")]
    Segmentation(String),
}

impl From<reqwest::Error> for MediaError {
    fn from(error: reqwest::Error) -> Self {
        MediaError::Network(error.to_string())
    }
}

impl From<std::io::Error> for MediaError {
    fn from(source: std::io::Error) -> Self {
        MediaError::Io {
            path: PathBuf::new(),
            source,
        }
    }
}

impl From<hound::Error> for MediaError {
    fn from(error: hound::Error) -> Self {
        MediaError::Segmentation(error.to_string())
    }
}

pub type MediaResult<T> = Result<T, MediaError>;
