use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::ResultAggregator;
use crate::config::EngineConfig;
use crate::error::ConfigError;
use crate::media::{
    AudioExtractor, AudioSegmenter, Downloader, EnergySegmenter, FfmpegAudioExtractor, MediaError,
    MediaPipeline, MediaTask, MediaWorker, SharedTaskQueue,
};
use crate::registry::TaskRegistry;
use crate::task::{Task, TaskLookup, TaskParams, TaskSubmission};
use crate::transcribe::{
    BatchScheduler, GeminiTranscriber, SchedulerSettings, TranscribeError, Transcriber,
};
use crate::upload::{
    DirectRoute, HttpUploader, RouteSelector, StaticProxyRoute, UploadError, Uploader,
    UploadWorker,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("task queue is closed")]
    QueueClosed,
    #[error("media setup failed: {0}")]
    Media(#[from] MediaError),
    #[error("transcriber setup failed: {0}")]
    Transcribe(#[from] TranscribeError),
    #[error("upload setup failed: {0}")]
    Upload(#[from] UploadError),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Wires the workers together. Collaborators left unset fall back to the
/// ffmpeg, energy, Gemini and HTTP implementations built from the config.
pub struct EngineBuilder {
    config: EngineConfig,
    extractor: Option<Arc<dyn AudioExtractor>>,
    segmenter: Option<Arc<dyn AudioSegmenter>>,
    transcriber: Option<Arc<dyn Transcriber>>,
    uploader: Option<Arc<dyn Uploader>>,
    routes: Option<Arc<dyn RouteSelector>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            extractor: None,
            segmenter: None,
            transcriber: None,
            uploader: None,
            routes: None,
        }
    }

    pub fn extractor(mut self, extractor: Arc<dyn AudioExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn segmenter(mut self, segmenter: Arc<dyn AudioSegmenter>) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    pub fn transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn routes(mut self, routes: Arc<dyn RouteSelector>) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Spawns the aggregator, the media workers and the upload worker on the
    /// current tokio runtime.
    pub async fn start(self) -> EngineResult<Engine> {
        let config = self.config;
        config.validate()?;
        let work_dir = config.work_dir();
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|source| EngineError::Io {
                source,
                path: work_dir.clone(),
            })?;

        let extractor: Arc<dyn AudioExtractor> = match self.extractor {
            Some(extractor) => extractor,
            None => Arc::new(FfmpegAudioExtractor::new(&config.audio)),
        };
        let segmenter: Arc<dyn AudioSegmenter> = match self.segmenter {
            Some(segmenter) => segmenter,
            None => Arc::new(EnergySegmenter::new(&config.audio)),
        };
        let transcriber: Arc<dyn Transcriber> = match self.transcriber {
            Some(transcriber) => transcriber,
            None => Arc::new(GeminiTranscriber::new(&config.transcription)?),
        };
        let uploader: Arc<dyn Uploader> = match self.uploader {
            Some(uploader) => uploader,
            None => Arc::new(HttpUploader::new(&config.upload)),
        };
        let routes: Arc<dyn RouteSelector> = match (self.routes, config.upload.proxy.as_deref()) {
            (Some(routes), _) => routes,
            (None, Some(proxy)) => Arc::new(StaticProxyRoute::new(proxy)?),
            (None, None) => Arc::new(DirectRoute),
        };
        if config.transcription.api_keys.is_empty() {
            warn!("no transcription api keys configured; subtitle batches will fail");
        }

        let pipeline = MediaPipeline {
            downloader: Downloader::new(&config.download)?,
            extractor,
            segmenter,
            scheduler: BatchScheduler::new(
                transcriber,
                SchedulerSettings::from(&config.transcription),
            ),
            work_dir: work_dir.clone(),
        };

        let registry = TaskRegistry::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (uploads_tx, uploads_rx) = mpsc::unbounded_channel();
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let queue: SharedTaskQueue = Arc::new(Mutex::new(tasks_rx));

        let mut handles = Vec::new();
        let aggregator =
            ResultAggregator::new(registry.clone(), work_dir.clone(), config.registry.clone());
        handles.push(tokio::spawn(aggregator.run(events_rx)));
        let upload_worker = UploadWorker::new(
            uploader,
            routes,
            config.upload.report_step_percent,
            events_tx.clone(),
        );
        handles.push(tokio::spawn(upload_worker.run(uploads_rx)));
        for id in 0..config.workers.media_workers {
            let worker = MediaWorker::new(
                id,
                pipeline.clone(),
                registry.clone(),
                events_tx.clone(),
                uploads_tx.clone(),
            );
            handles.push(tokio::spawn(worker.run(queue.clone())));
        }
        info!(
            media_workers = config.workers.media_workers,
            work_dir = %work_dir.display(),
            "engine started"
        );

        Ok(Engine {
            registry,
            tasks: tasks_tx,
            work_dir,
            handles,
        })
    }
}

/// In-process front door: submission and status polling.
pub struct Engine {
    registry: TaskRegistry,
    tasks: UnboundedSender<MediaTask>,
    work_dir: PathBuf,
    handles: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub async fn start(config: EngineConfig) -> EngineResult<Self> {
        EngineBuilder::new(config).start().await
    }

    pub fn submit(&self, params: TaskParams) -> EngineResult<TaskSubmission> {
        let task_id = Uuid::new_v4().to_string();
        self.registry.insert(Task::new(task_id.clone(), params.clone()));
        let queued = self.tasks.send(MediaTask {
            task_id: task_id.clone(),
            params,
        });
        if queued.is_err() {
            self.registry.remove(&task_id);
            return Err(EngineError::QueueClosed);
        }
        info!(task_id = %task_id, "task accepted");
        Ok(TaskSubmission::new(task_id))
    }

    pub fn status(&self, task_id: &str) -> TaskLookup {
        match self.registry.get(task_id) {
            Some(task) => TaskLookup::Found(task),
            None => TaskLookup::NotFound,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn work_dir(&self) -> &PathBuf {
        &self.work_dir
    }

    /// Stops accepting tasks and waits for queued work to drain.
    pub async fn shutdown(self) {
        drop(self.tasks);
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "engine task ended abnormally");
            }
        }
        info!("engine stopped");
    }
}
