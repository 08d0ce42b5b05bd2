mod error;
mod http;
mod route;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::events::{EventSender, WorkerEvent};
use crate::progress::Stage;
use crate::task::{Component, ComponentStatus, ErrorCode, TaskError, TaskId};

pub use error::{UploadError, UploadResult};
pub use http::{HttpUploader, ShareReference, UploadProgress, Uploader};
pub use route::{DirectRoute, RouteSelector, StaticProxyRoute, UploadRoute};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadCommand {
    Upload {
        task_id: TaskId,
        component: Component,
        local_path: PathBuf,
        file_name: String,
        /// Last upload of the task; its cached route is dropped afterwards.
        final_for_task: bool,
    },
    /// Drops the cached route of a task that will send no more uploads.
    Release { task_id: TaskId },
}

/// Emits a fraction only when it advanced by at least `step` percent, and
/// always once at 100%.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    step: u32,
    last_percent: Option<u32>,
}

impl ProgressThrottle {
    pub fn new(step_percent: u32) -> Self {
        Self {
            step: step_percent.clamp(1, 100),
            last_percent: None,
        }
    }

    pub fn observe(&mut self, sent: u64, total: u64) -> Option<f64> {
        let fraction = if total == 0 {
            1.0
        } else {
            (sent as f64 / total as f64).min(1.0)
        };
        let percent = (fraction * 100.0).floor() as u32;
        let due = match self.last_percent {
            Some(100) => false,
            _ if percent >= 100 => true,
            Some(last) => percent >= last + self.step,
            None => percent >= self.step,
        };
        if due {
            self.last_percent = Some(percent);
            Some(fraction)
        } else {
            None
        }
    }
}

/// Consumes upload commands one at a time, independent of media processing.
pub struct UploadWorker {
    uploader: Arc<dyn Uploader>,
    routes: Arc<dyn RouteSelector>,
    report_step_percent: u32,
    events: UnboundedSender<WorkerEvent>,
    route_cache: HashMap<TaskId, UploadRoute>,
}

impl UploadWorker {
    pub fn new(
        uploader: Arc<dyn Uploader>,
        routes: Arc<dyn RouteSelector>,
        report_step_percent: u32,
        events: UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            uploader,
            routes,
            report_step_percent,
            events,
            route_cache: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut commands: UnboundedReceiver<UploadCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        info!("upload queue closed; upload worker stopping");
    }

    pub fn cached_routes(&self) -> usize {
        self.route_cache.len()
    }

    pub async fn handle(&mut self, command: UploadCommand) {
        match command {
            UploadCommand::Release { task_id } => {
                if self.route_cache.remove(&task_id).is_some() {
                    debug!(task_id = %task_id, "upload route released");
                }
            }
            UploadCommand::Upload {
                task_id,
                component,
                local_path,
                file_name,
                final_for_task,
            } => {
                let events = EventSender::new(task_id.clone(), self.events.clone());
                let route = self.route_for(&task_id).await;
                self.upload_one(&events, component, &local_path, &file_name, &route)
                    .await;
                remove_uploaded(&task_id, &local_path).await;
                if final_for_task {
                    self.route_cache.remove(&task_id);
                }
            }
        }
    }

    async fn route_for(&mut self, task_id: &str) -> UploadRoute {
        if let Some(route) = self.route_cache.get(task_id) {
            return route.clone();
        }
        let route = match self.routes.select(task_id).await {
            Ok(route) => route,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "route selection failed; uploading directly");
                UploadRoute::direct()
            }
        };
        debug!(task_id = %task_id, route = route.label(), "upload route selected");
        self.route_cache.insert(task_id.to_string(), route.clone());
        route
    }

    async fn upload_one(
        &self,
        events: &EventSender,
        component: Component,
        local_path: &Path,
        file_name: &str,
        route: &UploadRoute,
    ) {
        let stage = Stage::upload_for(component);
        events.send_status(
            events
                .update(component)
                .status(ComponentStatus::Running)
                .details("uploading (0%)"),
        );
        let throttle = Mutex::new(ProgressThrottle::new(self.report_step_percent));
        let reporter = events.clone();
        let progress: UploadProgress = Arc::new(move |sent: u64, total: u64| {
            let due = throttle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .observe(sent, total);
            if let Some(fraction) = due {
                reporter.progress(stage, fraction);
                reporter.send_status(
                    reporter
                        .update(component)
                        .details(format!("uploading ({}%)", (fraction * 100.0).floor() as u32)),
                );
            }
        });

        match self
            .uploader
            .upload(local_path, file_name, route, progress)
            .await
        {
            Ok(share) => {
                info!(task_id = %events.task_id(), component = %component, file = file_name, "upload finished");
                let mut output = Map::new();
                output.insert("shareCode".into(), Value::String(share.share_code));
                events.progress(stage, 1.0);
                events.send_status(
                    events
                        .update(component)
                        .status(ComponentStatus::Success)
                        .details("upload complete")
                        .output(output),
                );
            }
            Err(err) => {
                warn!(task_id = %events.task_id(), component = %component, error = %err, "upload failed");
                let mut output = Map::new();
                output.insert("fileName".into(), Value::String(file_name.to_string()));
                events.send_status(
                    events
                        .update(component)
                        .status(ComponentStatus::Failed)
                        .details("upload failed")
                        .output(output)
                        .error(TaskError::new(ErrorCode::UploadFailed, err.to_string())),
                );
            }
        }
    }
}

async fn remove_uploaded(task_id: &str, path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            warn!(task_id = %task_id, path = %path.display(), error = %err, "failed to remove uploaded file")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct CountingSelector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RouteSelector for CountingSelector {
        async fn select(&self, task_id: &str) -> UploadResult<UploadRoute> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(UploadRoute {
                proxy: Some(format!("http://proxy-for-{task_id}:8080")),
            })
        }
    }

    struct StepUploader {
        fail: bool,
    }

    #[async_trait]
    impl Uploader for StepUploader {
        async fn upload(
            &self,
            _local_path: &Path,
            file_name: &str,
            _route: &UploadRoute,
            progress: UploadProgress,
        ) -> UploadResult<ShareReference> {
            for sent in 0..=100 {
                progress(sent, 100);
            }
            if self.fail && file_name.ends_with(".srt") {
                return Err(UploadError::Stalled {
                    after: std::time::Duration::from_secs(600),
                });
            }
            if self.fail {
                return Err(UploadError::Rejected {
                    status: 500,
                    body: "down".into(),
                });
            }
            Ok(ShareReference {
                share_code: format!("code-{file_name}"),
            })
        }
    }

    fn worker(fail: bool) -> (UploadWorker, Arc<CountingSelector>, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let selector = Arc::new(CountingSelector {
            calls: AtomicUsize::new(0),
        });
        let worker = UploadWorker::new(Arc::new(StepUploader { fail }), selector.clone(), 5, tx);
        (worker, selector, rx)
    }

    fn upload(dir: &TempDir, task_id: &str, component: Component, name: &str, last: bool) -> UploadCommand {
        let local_path = dir.path().join(name);
        std::fs::write(&local_path, b"payload").unwrap();
        UploadCommand::Upload {
            task_id: task_id.into(),
            component,
            local_path,
            file_name: name.into(),
            final_for_task: last,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn throttle_reports_steps_and_final() {
        let mut throttle = ProgressThrottle::new(5);
        let reported: Vec<f64> = (0..=1000u64)
            .filter_map(|sent| throttle.observe(sent, 1000))
            .collect();
        assert_eq!(reported.len(), 20);
        assert_eq!(reported.last().copied(), Some(1.0));
        assert!(throttle.observe(1000, 1000).is_none());

        let mut coarse = ProgressThrottle::new(50);
        assert_eq!(coarse.observe(10, 100), None);
        assert_eq!(coarse.observe(99, 100), Some(0.99));
        assert_eq!(coarse.observe(100, 100), Some(1.0));
    }

    #[tokio::test]
    async fn route_is_reused_until_final_upload() {
        let dir = TempDir::new().unwrap();
        let (mut worker, selector, _rx) = worker(false);
        worker
            .handle(upload(&dir, "t", Component::Video, "clip.mp4", false))
            .await;
        assert_eq!(worker.cached_routes(), 1);
        worker
            .handle(upload(&dir, "t", Component::Subtitle, "clip.srt", true))
            .await;
        assert_eq!(selector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(worker.cached_routes(), 0);
        assert!(!dir.path().join("clip.mp4").exists());
        assert!(!dir.path().join("clip.srt").exists());
    }

    #[tokio::test]
    async fn release_evicts_cached_route() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _selector, _rx) = worker(false);
        worker
            .handle(upload(&dir, "t", Component::Video, "clip.mp4", false))
            .await;
        worker
            .handle(UploadCommand::Release {
                task_id: "t".into(),
            })
            .await;
        assert_eq!(worker.cached_routes(), 0);
    }

    #[tokio::test]
    async fn success_reports_share_code_and_throttled_progress() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _selector, mut rx) = worker(false);
        worker
            .handle(upload(&dir, "t", Component::Video, "clip.mp4", true))
            .await;

        let events = drain(&mut rx);
        let fractions: Vec<f64> = events
            .iter()
            .filter_map(|event| match event {
                WorkerEvent::Progress(progress) => Some(progress.fraction),
                _ => None,
            })
            .collect();
        assert_eq!(fractions.len(), 21);
        let last = events.last().unwrap();
        match last {
            WorkerEvent::Status(update) => {
                assert_eq!(update.status, Some(ComponentStatus::Success));
                assert_eq!(update.output.as_ref().unwrap()["shareCode"], "code-clip.mp4");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_is_structured_and_file_still_removed() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _selector, mut rx) = worker(true);
        worker
            .handle(upload(&dir, "t", Component::Subtitle, "clip.srt", true))
            .await;

        assert!(!dir.path().join("clip.srt").exists());
        match drain(&mut rx).pop().unwrap() {
            WorkerEvent::Status(update) => {
                assert_eq!(update.status, Some(ComponentStatus::Failed));
                let error = update.error.unwrap();
                assert_eq!(error.code, crate::task::ErrorCode::UploadFailed);
                assert!(error.message.contains("stalled"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
