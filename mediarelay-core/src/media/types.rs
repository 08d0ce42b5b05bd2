use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::task::{task_namespace, TaskId, TaskParams};

use super::error::{MediaError, MediaResult};

const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mkv", "webm", "mov", "avi", "flv", "wmv", "ts", "mpg", "mpeg", "3gp", "mp3",
    "m4a", "aac", "wav", "flac", "ogg", "oga", "opus", "wma",
];

/// Submission handed from the front door to a media worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTask {
    pub task_id: TaskId,
    pub params: TaskParams,
}

/// One bounded audio segment with absolute offsets into the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub path: PathBuf,
    pub start_offset_ms: u64,
    pub end_offset_ms: u64,
}

/// File fetched into the task namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: u64,
}

impl SourceFile {
    /// Media content type, or a known audio/video file extension.
    pub fn is_recognized_media(&self) -> bool {
        if let Some(content_type) = self.content_type.as_deref() {
            let essence = content_type.trim().to_ascii_lowercase();
            if essence.starts_with("video/") || essence.starts_with("audio/") {
                return true;
            }
        }
        has_media_extension(&self.file_name) || has_media_extension(&self.path.to_string_lossy())
    }
}

fn has_media_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Paths owned by one task under `<work_dir>/task_<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskWorkspace {
    pub root: PathBuf,
    pub chunks: PathBuf,
}

impl TaskWorkspace {
    pub fn new(work_dir: &Path, task_id: &str) -> Self {
        let root = task_namespace(work_dir, task_id);
        let chunks = root.join("chunks");
        Self { root, chunks }
    }

    pub async fn prepare(&self) -> MediaResult<()> {
        for dir in [&self.root, &self.chunks] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| MediaError::Io {
                    path: dir.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    pub fn source_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn raw_audio_path(&self) -> PathBuf {
        self.root.join("audio_raw.wav")
    }

    pub fn chunk_path(&self, index: usize) -> PathBuf {
        self.chunks.join(format!("chunk_{index:05}.wav"))
    }

    pub fn subtitle_path(&self, file_name: &str) -> PathBuf {
        self.root.join(subtitle_file_name(file_name))
    }
}

/// Last URL path segment, percent-decoded, or `file_<task_id>` when the URL
/// carries no usable name.
pub fn derive_file_name(url: &str, task_id: &str) -> String {
    let fallback = || format!("file_{task_id}");
    let Ok(parsed) = Url::parse(url) else {
        return fallback();
    };
    let Some(segment) = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
    else {
        return fallback();
    };
    let decoded = urlencoding::decode(segment)
        .map(|name| name.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    let name = decoded
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if name.is_empty() || name == "." || name == ".." {
        fallback()
    } else {
        name
    }
}

pub fn subtitle_file_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or(file_name);
    format!("{stem}.srt")
}
