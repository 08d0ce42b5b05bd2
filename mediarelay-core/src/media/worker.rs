use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::panic_message;
use crate::events::{EventSender, WorkerEvent};
use crate::progress::Stage;
use crate::registry::TaskRegistry;
use crate::task::{Component, ComponentStatus, ErrorCode, TaskError, TaskParams};
use crate::transcribe::{render_srt, BatchScheduler};
use crate::upload::UploadCommand;

use super::download::Downloader;
use super::ffmpeg::AudioExtractor;
use super::segment::AudioSegmenter;
use super::types::{derive_file_name, subtitle_file_name, MediaTask, SourceFile, TaskWorkspace};

/// Task queue shared by every media worker.
pub type SharedTaskQueue = Arc<Mutex<UnboundedReceiver<MediaTask>>>;

const EXTRACTED_FRACTION: f64 = 0.10;
const SEGMENTED_FRACTION: f64 = 0.35;

/// Collaborators a media worker drives for each task.
#[derive(Clone)]
pub struct MediaPipeline {
    pub downloader: Downloader,
    pub extractor: Arc<dyn AudioExtractor>,
    pub segmenter: Arc<dyn AudioSegmenter>,
    pub scheduler: BatchScheduler,
    pub work_dir: PathBuf,
}

pub struct MediaWorker {
    id: usize,
    pipeline: MediaPipeline,
    registry: TaskRegistry,
    events: UnboundedSender<WorkerEvent>,
    uploads: UnboundedSender<UploadCommand>,
}

impl MediaWorker {
    pub fn new(
        id: usize,
        pipeline: MediaPipeline,
        registry: TaskRegistry,
        events: UnboundedSender<WorkerEvent>,
        uploads: UnboundedSender<UploadCommand>,
    ) -> Self {
        Self {
            id,
            pipeline,
            registry,
            events,
            uploads,
        }
    }

    pub async fn run(self, queue: SharedTaskQueue) {
        loop {
            let next = queue.lock().await.recv().await;
            let Some(task) = next else {
                break;
            };
            self.handle(task).await;
        }
        info!(worker = self.id, "task queue closed; media worker stopping");
    }

    /// Runs one task; a panic inside the pipeline becomes a fatal task event.
    /// Tasks already settled (or evicted) while queued are dropped unprocessed.
    pub async fn handle(&self, task: MediaTask) {
        match self.registry.get(&task.task_id) {
            Some(current) if !current.status.is_terminal() => {}
            Some(current) => {
                debug!(worker = self.id, task_id = %task.task_id, status = %current.status, "task already settled; skipping");
                return;
            }
            None => {
                debug!(worker = self.id, task_id = %task.task_id, "task no longer registered; skipping");
                return;
            }
        }

        let events = EventSender::new(task.task_id.clone(), self.events.clone());
        let outcome = AssertUnwindSafe(self.process(&task, &events))
            .catch_unwind()
            .await;
        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            error!(worker = self.id, task_id = %task.task_id, panic = %message, "media pipeline panicked");
            events.fatal(TaskError::new(ErrorCode::WorkerPanic, message));
            self.enqueue(
                &events,
                UploadCommand::Release {
                    task_id: task.task_id.clone(),
                },
            );
        }
    }

    async fn process(&self, task: &MediaTask, events: &EventSender) {
        let params = &task.params;
        info!(worker = self.id, task_id = %task.task_id, url = %params.url, "media task started");
        if !params.needs_download() {
            for component in Component::ALL {
                events.send_status(
                    events
                        .update(component)
                        .status(ComponentStatus::Skipped)
                        .details("not requested"),
                );
            }
            return;
        }

        let workspace = TaskWorkspace::new(&self.pipeline.work_dir, &task.task_id);
        let source = match self.download(task, &workspace, events).await {
            Ok(source) => source,
            Err(err) => {
                error!(task_id = %task.task_id, error = %err, "download failed");
                events.fatal(err);
                return;
            }
        };

        let raw_audio = if params.extract_subtitle {
            self.extract_audio(&source, &workspace, events).await
        } else {
            None
        };
        let subtitle_upload_follows = raw_audio.is_some() && params.upload_subtitle;

        self.dispatch_video(task, &source, subtitle_upload_follows, events);

        if let Some(raw_audio) = raw_audio {
            let result = self
                .transcribe(params, &raw_audio, &source, &workspace, events)
                .await;
            if let Err(err) = result {
                warn!(task_id = %task.task_id, error = %err, "subtitle pipeline failed");
                events.progress(Stage::SubtitlePipeline, 1.0);
                events.send_status(
                    events
                        .update(Component::Subtitle)
                        .status(ComponentStatus::Failed)
                        .details(err.message.clone())
                        .error(err),
                );
                if subtitle_upload_follows {
                    self.enqueue(
                        events,
                        UploadCommand::Release {
                            task_id: task.task_id.clone(),
                        },
                    );
                }
            }
        }
        debug!(worker = self.id, task_id = %task.task_id, "media task handed off");
    }

    async fn download(
        &self,
        task: &MediaTask,
        workspace: &TaskWorkspace,
        events: &EventSender,
    ) -> Result<SourceFile, TaskError> {
        let params = &task.params;
        let tracked = if params.upload_video {
            Component::Video
        } else {
            Component::Subtitle
        };
        events.send_status(
            events
                .update(tracked)
                .status(ComponentStatus::Running)
                .details("downloading"),
        );
        workspace
            .prepare()
            .await
            .map_err(|err| TaskError::new(ErrorCode::DownloadFailed, err.to_string()))?;
        let file_name = derive_file_name(&params.url, &task.task_id);
        let dest = workspace.source_path(&file_name);
        self.pipeline
            .downloader
            .fetch(&params.url, &dest, &file_name, tracked, events)
            .await
            .map_err(|err| TaskError::new(ErrorCode::DownloadFailed, err.to_string()))
    }

    async fn extract_audio(
        &self,
        source: &SourceFile,
        workspace: &TaskWorkspace,
        events: &EventSender,
    ) -> Option<PathBuf> {
        if !source.is_recognized_media() {
            info!(task_id = %events.task_id(), file = %source.file_name, "source is not media; skipping subtitles");
            events.progress(Stage::SubtitlePipeline, 1.0);
            events.send_status(
                events
                    .update(Component::Subtitle)
                    .status(ComponentStatus::Skipped)
                    .details("source is not a recognized media file"),
            );
            return None;
        }
        events.send_status(
            events
                .update(Component::Subtitle)
                .status(ComponentStatus::Running)
                .details("extracting audio"),
        );
        match self.pipeline.extractor.extract(&source.path, workspace).await {
            Ok(path) => {
                events.progress(Stage::SubtitlePipeline, EXTRACTED_FRACTION);
                events.send_status(events.update(Component::Subtitle).details("audio extracted"));
                Some(path)
            }
            Err(err) => {
                warn!(task_id = %events.task_id(), error = %err, "audio extraction failed");
                events.progress(Stage::SubtitlePipeline, 1.0);
                events.send_status(
                    events
                        .update(Component::Subtitle)
                        .status(ComponentStatus::Failed)
                        .details("audio extraction failed")
                        .error(TaskError::new(
                            ErrorCode::AudioExtractionFailed,
                            err.to_string(),
                        )),
                );
                None
            }
        }
    }

    fn dispatch_video(
        &self,
        task: &MediaTask,
        source: &SourceFile,
        subtitle_upload_follows: bool,
        events: &EventSender,
    ) {
        if !task.params.upload_video {
            events.send_status(
                events
                    .update(Component::Video)
                    .status(ComponentStatus::Skipped)
                    .details("not requested"),
            );
            return;
        }
        events.send_status(
            events
                .update(Component::Video)
                .status(ComponentStatus::Running)
                .details("upload dispatched"),
        );
        events.progress(Stage::VideoUpload, 0.01);
        self.enqueue(
            events,
            UploadCommand::Upload {
                task_id: task.task_id.clone(),
                component: Component::Video,
                local_path: source.path.clone(),
                file_name: source.file_name.clone(),
                final_for_task: !subtitle_upload_follows,
            },
        );
    }

    async fn transcribe(
        &self,
        params: &TaskParams,
        raw_audio: &Path,
        source: &SourceFile,
        workspace: &TaskWorkspace,
        events: &EventSender,
    ) -> Result<(), TaskError> {
        let units = self
            .pipeline
            .segmenter
            .segment(raw_audio, workspace)
            .await
            .map_err(pipeline_failed)?;
        events.progress(Stage::SubtitlePipeline, SEGMENTED_FRACTION);
        if units.is_empty() {
            return Err(TaskError::new(
                ErrorCode::NoContent,
                "no speech detected in the audio track",
            ));
        }
        let batches = self.pipeline.scheduler.settings().batch_count(units.len());
        events.send_status(
            events
                .update(Component::Subtitle)
                .details(format!("transcribing {} units in {batches} batches", units.len())),
        );

        let outcome = self
            .pipeline
            .scheduler
            .run(units, |done, total| {
                let fraction =
                    SEGMENTED_FRACTION + (1.0 - SEGMENTED_FRACTION) * done as f64 / total as f64;
                events.progress(Stage::SubtitlePipeline, fraction);
                events.send_status(
                    events
                        .update(Component::Subtitle)
                        .details(format!("transcribed {done}/{total} batches")),
                );
            })
            .await;

        if outcome.all_batches_failed() {
            return Err(TaskError::new(
                ErrorCode::AllBatchesFailed,
                format!("all {} transcription batches failed", outcome.batches_total),
            ));
        }
        if outcome.lines.is_empty() {
            return Err(TaskError::new(
                ErrorCode::NoContent,
                "transcription returned no lines",
            ));
        }

        let srt = render_srt(&outcome.lines);
        let mut output = Map::new();
        output.insert("contentBase64".into(), Value::String(STANDARD.encode(srt.as_bytes())));
        output.insert("lineCount".into(), Value::from(outcome.lines.len()));
        if !outcome.failed_batches.is_empty() {
            output.insert("failedBatches".into(), Value::from(outcome.failed_batches.clone()));
        }
        events.progress(Stage::SubtitlePipeline, 1.0);

        if !params.upload_subtitle {
            events.send_status(
                events
                    .update(Component::Subtitle)
                    .status(ComponentStatus::Success)
                    .details(format!("{} subtitle lines ready", outcome.lines.len()))
                    .output(output),
            );
            return Ok(());
        }

        let srt_name = subtitle_file_name(&source.file_name);
        let srt_path = workspace.subtitle_path(&source.file_name);
        fs::write(&srt_path, srt.as_bytes())
            .await
            .map_err(pipeline_failed)?;
        events.send_status(
            events
                .update(Component::Subtitle)
                .details("upload dispatched")
                .output(output),
        );
        events.progress(Stage::SubtitleUpload, 0.01);
        self.enqueue(
            events,
            UploadCommand::Upload {
                task_id: events.task_id().to_string(),
                component: Component::Subtitle,
                local_path: srt_path,
                file_name: srt_name,
                final_for_task: true,
            },
        );
        Ok(())
    }

    fn enqueue(&self, events: &EventSender, command: UploadCommand) {
        let component = match &command {
            UploadCommand::Upload { component, .. } => Some(*component),
            UploadCommand::Release { .. } => None,
        };
        if self.uploads.send(command).is_err() {
            warn!(task_id = %events.task_id(), "upload queue closed");
            if let Some(component) = component {
                events.send_status(
                    events
                        .update(component)
                        .status(ComponentStatus::Failed)
                        .details("upload queue closed")
                        .error(TaskError::new(ErrorCode::UploadFailed, "upload queue closed")),
                );
            }
        }
    }
}

fn pipeline_failed(err: impl std::fmt::Display) -> TaskError {
    TaskError::new(ErrorCode::SubtitlePipelineFailed, err.to_string())
}
