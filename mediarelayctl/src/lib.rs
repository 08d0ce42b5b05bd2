use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use mediarelay_core::{
    load_engine_config, Component, Engine, EngineConfig, StaticProxyRoute, Task, TaskLookup,
    TaskParams, TaskStatus,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] mediarelay_core::ConfigError),
    #[error("engine error: {0}")]
    Engine(#[from] mediarelay_core::EngineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("task {task_id} finished with status {status}")]
    TaskNotSuccessful { task_id: String, status: TaskStatus },
    #[error("task {0} is no longer tracked")]
    TaskLost(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "mediarelay task runner", long_about = None)]
pub struct Cli {
    /// Path to mediarelay.toml
    #[arg(long, default_value = "configs/mediarelay.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Downloads a URL, optionally transcribes and uploads it, and waits for the result
    Run(RunArgs),
    /// Configuration inspection
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Checks the work directory and external tools
    Health,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Source media URL (http, https or file)
    pub url: String,
    /// Keep the downloaded file local instead of uploading it
    #[arg(long, default_value_t = false)]
    pub no_upload_video: bool,
    /// Generate subtitles from the audio track
    #[arg(long, default_value_t = false)]
    pub extract_subtitle: bool,
    /// Upload the generated subtitle file
    #[arg(long, default_value_t = false)]
    pub upload_subtitle: bool,
    /// Status polling interval in milliseconds
    #[arg(long, default_value_t = 500)]
    pub poll_ms: u64,
}

impl RunArgs {
    pub fn params(&self) -> TaskParams {
        TaskParams {
            url: self.url.clone(),
            upload_video: !self.no_upload_video,
            extract_subtitle: self.extract_subtitle || self.upload_subtitle,
            upload_subtitle: self.upload_subtitle,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Prints the resolved configuration
    Show,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Run(args) => {
            let task = context.run_task(args, cli.format).await?;
            render(&TaskReport(&task), cli.format)?;
            if task.status != TaskStatus::Success {
                return Err(AppError::TaskNotSuccessful {
                    task_id: task.task_id,
                    status: task.status,
                });
            }
        }
        Commands::Config(ConfigCommands::Show) => {
            render(&context.summary(), cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report.has_errors() {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn render<T: Serialize + fmt::Display>(value: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{value}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

#[derive(Debug)]
struct AppContext {
    config_path: PathBuf,
    config: EngineConfig,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_engine_config(&cli.config)?;
        debug!(path = %cli.config.display(), "configuration loaded");
        Ok(Self {
            config_path: cli.config.clone(),
            config,
        })
    }

    async fn run_task(&self, args: &RunArgs, format: OutputFormat) -> Result<Task> {
        let engine = Engine::start(self.config.clone()).await?;
        let submission = engine.submit(args.params())?;
        info!(task_id = %submission.task_id, url = %args.url, "task submitted");

        let interval = Duration::from_millis(args.poll_ms.max(10));
        let mut last_progress = None;
        let task = loop {
            match engine.status(&submission.task_id) {
                TaskLookup::Found(task) => {
                    if format == OutputFormat::Text && last_progress != Some(task.progress) {
                        eprintln!("{:>3}% {}", task.progress, task.status);
                        last_progress = Some(task.progress);
                    }
                    if task.status.is_terminal() {
                        break task;
                    }
                }
                TaskLookup::NotFound => {
                    return Err(AppError::TaskLost(submission.task_id));
                }
            }
            tokio::time::sleep(interval).await;
        };
        engine.shutdown().await;
        Ok(task)
    }

    fn summary(&self) -> ConfigSummary {
        let config = &self.config;
        ConfigSummary {
            config_path: self.config_path.display().to_string(),
            work_dir: config.paths.work_dir.clone(),
            media_workers: config.workers.media_workers,
            ffmpeg_path: config.audio.ffmpeg_path.clone(),
            transcription_model: config.transcription.model.clone(),
            api_keys: config.transcription.api_keys.len(),
            prompt_url: config.transcription.prompt_url.clone(),
            batch_size: config.transcription.batch_size,
            concurrency_limit: config.transcription.concurrency_limit,
            requests_per_minute: config.transcription.requests_per_minute,
            upload_base_url: config.upload.base_url.clone(),
            upload_proxy: config.upload.proxy.clone(),
            stale_after_minutes: config.registry.stale_after_minutes,
        }
    }

    fn health_check(&self) -> HealthReport {
        HealthReport(vec![
            HealthEntry::new("config", config_file_state(&self.config_path)),
            HealthEntry::new("work_dir", work_dir_state(&self.config.work_dir())),
            HealthEntry::new("ffmpeg", ffmpeg_state(&self.config.audio.ffmpeg_path)),
            HealthEntry::new("transcription", self.credentials_state()),
            HealthEntry::new("upload", self.route_state()),
        ])
    }

    fn credentials_state(&self) -> (CheckStatus, String) {
        match self.config.transcription.api_keys.len() {
            0 => (
                CheckStatus::Warn,
                "no api keys configured; subtitle extraction will fail".into(),
            ),
            keys => (CheckStatus::Ok, format!("{keys} api key(s) configured")),
        }
    }

    fn route_state(&self) -> (CheckStatus, String) {
        match self.config.upload.proxy.as_deref() {
            None => (CheckStatus::Ok, "direct route".into()),
            Some(proxy) => match StaticProxyRoute::new(proxy) {
                Ok(_) => (CheckStatus::Ok, format!("proxy {proxy}")),
                Err(err) => (CheckStatus::Error, err.to_string()),
            },
        }
    }
}

fn config_file_state(path: &Path) -> (CheckStatus, String) {
    if path.is_file() {
        (CheckStatus::Ok, path.display().to_string())
    } else {
        (CheckStatus::Error, format!("{} missing", path.display()))
    }
}

/// Creates the directory if needed and round-trips a marker file through it.
fn work_dir_state(dir: &Path) -> (CheckStatus, String) {
    let marker = dir.join(".mediarelay-write-check");
    let writable = fs::create_dir_all(dir)
        .and_then(|_| fs::write(&marker, b"ok"))
        .and_then(|_| fs::remove_file(&marker));
    match writable {
        Ok(()) => (CheckStatus::Ok, format!("{} writable", dir.display())),
        Err(err) => (
            CheckStatus::Error,
            format!("{} not writable: {err}", dir.display()),
        ),
    }
}

fn ffmpeg_state(binary: &str) -> (CheckStatus, String) {
    let status = Command::new(binary)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => (CheckStatus::Ok, binary.to_string()),
        Ok(status) => (CheckStatus::Warn, format!("{binary} exited with {status}")),
        Err(err) => (CheckStatus::Error, format!("{binary} not runnable: {err}")),
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub config_path: String,
    pub work_dir: String,
    pub media_workers: usize,
    pub ffmpeg_path: String,
    pub transcription_model: String,
    pub api_keys: usize,
    pub prompt_url: Option<String>,
    pub batch_size: usize,
    pub concurrency_limit: usize,
    pub requests_per_minute: f64,
    pub upload_base_url: String,
    pub upload_proxy: Option<String>,
    pub stale_after_minutes: u64,
}

impl fmt::Display for ConfigSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Config: {}", self.config_path)?;
        writeln!(f, "Work dir: {} ({} media worker(s))", self.work_dir, self.media_workers)?;
        writeln!(f, "ffmpeg: {}", self.ffmpeg_path)?;
        writeln!(
            f,
            "Transcription: {} with {} key(s), batches of {} x{} at {:.1} req/min",
            self.transcription_model,
            self.api_keys,
            self.batch_size,
            self.concurrency_limit,
            self.requests_per_minute
        )?;
        writeln!(
            f,
            "Prompts: {}",
            self.prompt_url.as_deref().unwrap_or("configured")
        )?;
        writeln!(
            f,
            "Upload: {} via {}",
            self.upload_base_url,
            self.upload_proxy.as_deref().unwrap_or("direct route")
        )?;
        write!(f, "Watchdog: {} min", self.stale_after_minutes)
    }
}

/// Text and JSON view of a finished task.
#[derive(Serialize)]
#[serde(transparent)]
struct TaskReport<'a>(&'a Task);

impl fmt::Display for TaskReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task = self.0;
        write!(f, "Task {}: {} ({}%)", task.task_id, task.status, task.progress)?;
        if let Some(error) = &task.error {
            write!(f, "\n  error: {error}")?;
        }
        for component in Component::ALL {
            let result = task.results.get(component);
            write!(f, "\n  {component}: {} | {}", result.status, result.details)?;
            let share_code = result
                .output
                .as_ref()
                .and_then(|output| output.get("shareCode"))
                .and_then(|code| code.as_str());
            if let Some(code) = share_code {
                write!(f, " | share={code}")?;
            }
            if let Some(error) = &result.error {
                write!(f, " | {error}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warn,
    Error,
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl HealthEntry {
    fn new(name: &'static str, (status, detail): (CheckStatus, String)) -> Self {
        Self {
            name,
            status,
            detail,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct HealthReport(pub Vec<HealthEntry>);

impl HealthReport {
    pub fn has_errors(&self) -> bool {
        self.0.iter().any(|entry| entry.status == CheckStatus::Error)
    }

    pub fn status_of(&self, name: &str) -> Option<CheckStatus> {
        self.0
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.status)
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, entry) in self.0.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            let label = match entry.status {
                CheckStatus::Ok => "ok",
                CheckStatus::Warn => "WARN",
                CheckStatus::Error => "FAIL",
            };
            write!(f, "{label:>4}  {:<13} {}", entry.name, entry.detail)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn prepare_test_context(ffmpeg: &str) -> (TempDir, AppContext) {
        let temp = TempDir::new().unwrap();
        let config_text = fs::read_to_string("../configs/mediarelay.toml").unwrap();
        let work_dir = temp.path().join("work");
        let config_text = config_text
            .replace(
                "work_dir = \"/var/lib/mediarelay/work\"",
                &format!("work_dir = {:?}", work_dir.display().to_string()),
            )
            .replace("ffmpeg_path = \"ffmpeg\"", &format!("ffmpeg_path = {ffmpeg:?}"));
        let config_path = temp.path().join("mediarelay.toml");
        fs::write(&config_path, config_text).unwrap();

        let cli = Cli::try_parse_from([
            "mediarelayctl",
            "--config",
            config_path.to_str().unwrap(),
            "--format",
            "json",
            "health",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        let context = AppContext::new(&cli).unwrap();
        (temp, context)
    }

    #[test]
    fn run_args_map_to_task_params() {
        let cli = Cli::try_parse_from([
            "mediarelayctl",
            "run",
            "https://example.com/a.mp4",
            "--no-upload-video",
            "--upload-subtitle",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        let params = args.params();
        assert!(!params.upload_video);
        assert!(params.extract_subtitle);
        assert!(params.upload_subtitle);
        assert_eq!(args.poll_ms, 500);
    }

    #[test]
    fn summary_reflects_loaded_config() {
        let (_temp, context) = prepare_test_context("ffmpeg");
        let summary = context.summary();
        assert_eq!(summary.batch_size, 40);
        assert_eq!(summary.transcription_model, "gemini-2.5-flash");
        let text = summary.to_string();
        assert!(text.contains("direct route"));
        assert!(text.contains("Prompts: configured"));
    }

    #[test]
    fn health_flags_missing_ffmpeg_and_accepts_work_dir() {
        let (_temp, context) = prepare_test_context("/nonexistent/ffmpeg-binary");
        let report = context.health_check();
        assert_eq!(report.status_of("config"), Some(CheckStatus::Ok));
        assert_eq!(report.status_of("work_dir"), Some(CheckStatus::Ok));
        assert_eq!(report.status_of("ffmpeg"), Some(CheckStatus::Error));
        assert_eq!(report.status_of("transcription"), Some(CheckStatus::Warn));
        assert_eq!(report.status_of("upload"), Some(CheckStatus::Ok));
        assert!(report.has_errors());
        assert!(context.config.work_dir().exists());
        assert!(!context.config.work_dir().join(".mediarelay-write-check").exists());

        let text = report.to_string();
        assert!(text.lines().any(|line| line.starts_with("FAIL  ffmpeg")));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json[2]["status"], "error");
        assert_eq!(json[2]["name"], "ffmpeg");
    }

    #[test]
    fn task_renders_components() {
        let task = Task::new("abc", TaskParams::new("https://example.com/a.mp4"));
        let report = TaskReport(&task);
        let text = report.to_string();
        assert!(text.starts_with("Task abc: QUEUED (0%)"));
        assert!(text.contains("video: PENDING"));
        assert!(text.contains("subtitle: SKIPPED"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["taskId"], "abc");
        assert_eq!(json["status"], "QUEUED");
    }
}
