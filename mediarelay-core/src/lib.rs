pub mod aggregator;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod progress;
pub mod registry;
pub mod task;
pub mod transcribe;
pub mod upload;

pub use aggregator::ResultAggregator;
pub use config::{
    load_engine_config, AudioSection, DownloadSection, EngineConfig, PathsSection,
    RegistrySection, TranscriptionSection, UploadSection, WorkersSection, API_KEYS_ENV,
};
pub use engine::{Engine, EngineBuilder, EngineError, EngineResult};
pub use error::{ConfigError, Result};
pub use events::{EventSender, FatalEvent, ProgressEvent, StatusUpdate, WorkerEvent};
pub use media::{
    AudioExtractor, AudioSegmenter, EnergySegmenter, FfmpegAudioExtractor, MediaError,
    MediaResult, TaskWorkspace, WorkUnit,
};
pub use progress::{ProgressModel, Stage};
pub use registry::TaskRegistry;
pub use task::{
    Component, ComponentResult, ComponentStatus, ErrorCode, Task, TaskError, TaskId, TaskLookup,
    TaskParams, TaskResults, TaskStatus, TaskSubmission,
};
pub use transcribe::{
    render_srt, BatchScheduler, GeminiTranscriber, Prompts, RawLine, SchedulerSettings, TranscribeError,
    TranscribeResult, Transcriber, TranscriptLine, TranscriptOutcome, TranscriptionRequest,
};
pub use upload::{
    DirectRoute, HttpUploader, RouteSelector, ShareReference, StaticProxyRoute, UploadError,
    UploadProgress, UploadResult, UploadRoute, Uploader,
};
