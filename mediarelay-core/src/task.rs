use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type TaskId = String;

/// Scratch directory owned by a task: `<work_dir>/task_<id>`.
pub fn task_namespace(work_dir: &Path, task_id: &str) -> PathBuf {
    work_dir.join(format!("task_{task_id}"))
}

/// Operations requested for a single submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    pub url: String,
    #[serde(default = "default_upload_video")]
    pub upload_video: bool,
    #[serde(default)]
    pub extract_subtitle: bool,
    #[serde(default)]
    pub upload_subtitle: bool,
}

fn default_upload_video() -> bool {
    true
}

impl TaskParams {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            upload_video: true,
            extract_subtitle: false,
            upload_subtitle: false,
        }
    }

    pub fn needs_download(&self) -> bool {
        self.upload_video || self.extract_subtitle
    }

    pub fn uploads_subtitle(&self) -> bool {
        self.extract_subtitle && self.upload_subtitle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failed,
    PartialSuccess,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::PartialSuccess => "PARTIAL_SUCCESS",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::PartialSuccess
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentStatus {
    Pending,
    Skipped,
    Running,
    Success,
    Failed,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::Pending => "PENDING",
            ComponentStatus::Skipped => "SKIPPED",
            ComponentStatus::Running => "RUNNING",
            ComponentStatus::Success => "SUCCESS",
            ComponentStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ComponentStatus::Skipped | ComponentStatus::Success | ComponentStatus::Failed
        )
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Video,
    Subtitle,
}

impl Component {
    pub const ALL: [Component; 2] = [Component::Video, Component::Subtitle];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Video => "video",
            Component::Subtitle => "subtitle",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DownloadFailed,
    AudioExtractionFailed,
    SubtitlePipelineFailed,
    NoContent,
    AllBatchesFailed,
    UploadFailed,
    WorkerCrashed,
    WorkerPanic,
    TaskTimeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DownloadFailed => "DOWNLOAD_FAILED",
            ErrorCode::AudioExtractionFailed => "AUDIO_EXTRACTION_FAILED",
            ErrorCode::SubtitlePipelineFailed => "SUBTITLE_PIPELINE_FAILED",
            ErrorCode::NoContent => "NO_CONTENT",
            ErrorCode::AllBatchesFailed => "ALL_BATCHES_FAILED",
            ErrorCode::UploadFailed => "UPLOAD_FAILED",
            ErrorCode::WorkerCrashed => "WORKER_CRASHED",
            ErrorCode::WorkerPanic => "WORKER_PANIC",
            ErrorCode::TaskTimeout => "TASK_TIMEOUT",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
}

impl TaskError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentResult {
    pub status: ComponentStatus,
    pub details: String,
    pub output: Option<Map<String, Value>>,
    pub error: Option<TaskError>,
}

impl ComponentResult {
    fn initial(requested: bool) -> Self {
        if requested {
            Self {
                status: ComponentStatus::Pending,
                details: "waiting to be processed".into(),
                output: None,
                error: None,
            }
        } else {
            Self {
                status: ComponentStatus::Skipped,
                details: "not requested".into(),
                output: None,
                error: None,
            }
        }
    }

    /// Adds new keys to the output map, overwriting only keys present in
    /// `extra`.
    pub fn merge_output(&mut self, extra: Map<String, Value>) {
        match self.output.as_mut() {
            Some(existing) => existing.extend(extra),
            None => self.output = Some(extra),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResults {
    pub video: ComponentResult,
    pub subtitle: ComponentResult,
}

impl TaskResults {
    pub fn get(&self, component: Component) -> &ComponentResult {
        match component {
            Component::Video => &self.video,
            Component::Subtitle => &self.subtitle,
        }
    }

    pub fn get_mut(&mut self, component: Component) -> &mut ComponentResult {
        match component {
            Component::Video => &mut self.video,
            Component::Subtitle => &mut self.subtitle,
        }
    }
}

/// Status document returned to pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    pub results: TaskResults,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub params: TaskParams,
}

impl Task {
    pub fn new(task_id: impl Into<TaskId>, params: TaskParams) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Queued,
            progress: 0,
            results: TaskResults {
                video: ComponentResult::initial(params.upload_video),
                subtitle: ComponentResult::initial(params.extract_subtitle),
            },
            error: None,
            created_at: now,
            updated_at: now,
            params,
        }
    }

    /// Neither component is pending nor running.
    pub fn components_settled(&self) -> bool {
        Component::ALL.iter().all(|component| {
            !matches!(
                self.results.get(*component).status,
                ComponentStatus::Pending | ComponentStatus::Running
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_id: TaskId,
    pub status_url: String,
}

impl TaskSubmission {
    pub fn new(task_id: impl Into<TaskId>) -> Self {
        let task_id = task_id.into();
        let status_url = format!("/api/tasks/{task_id}");
        Self {
            task_id,
            status_url,
        }
    }
}

/// Result of a status poll. `NotFound` is terminal for pollers.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskLookup {
    Found(Task),
    NotFound,
}

impl TaskLookup {
    pub fn is_terminal(&self) -> bool {
        match self {
            TaskLookup::Found(task) => task.status.is_terminal(),
            TaskLookup::NotFound => true,
        }
    }

    pub fn task(&self) -> Option<&Task> {
        match self {
            TaskLookup::Found(task) => Some(task),
            TaskLookup::NotFound => None,
        }
    }
}
