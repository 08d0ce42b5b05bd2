mod download;
mod error;
mod ffmpeg;
mod segment;
mod types;
mod worker;

pub use download::Downloader;
pub use error::{MediaError, MediaResult};
pub use ffmpeg::{AudioExtractor, FfmpegAudioExtractor};
pub use segment::{AudioSegmenter, EnergySegmenter};
pub use types::{derive_file_name, subtitle_file_name, MediaTask, SourceFile, TaskWorkspace, WorkUnit};
pub use worker::{MediaPipeline, MediaWorker, SharedTaskQueue};
