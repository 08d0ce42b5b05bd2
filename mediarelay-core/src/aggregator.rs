use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::RegistrySection;
use crate::events::{StatusUpdate, WorkerEvent};
use crate::progress::ProgressModel;
use crate::registry::TaskRegistry;
use crate::task::{
    task_namespace, Component, ComponentStatus, ErrorCode, Task, TaskError, TaskId, TaskStatus,
};

enum Applied {
    Ignored,
    Updated,
    Finished(TaskStatus),
}

/// Sole consumer of worker events and sole writer of task state after
/// submission.
pub struct ResultAggregator {
    registry: TaskRegistry,
    work_dir: PathBuf,
    config: RegistrySection,
    models: HashMap<TaskId, ProgressModel>,
}

impl ResultAggregator {
    pub fn new(registry: TaskRegistry, work_dir: PathBuf, config: RegistrySection) -> Self {
        Self {
            registry,
            work_dir,
            config,
            models: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut events: UnboundedReceiver<WorkerEvent>) {
        let mut ticker = interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.apply(event).await,
                    None => break,
                },
                _ = ticker.tick() => self.sweep(Utc::now()).await,
            }
        }
        info!("result queue closed; aggregator stopping");
    }

    pub async fn apply(&mut self, event: WorkerEvent) {
        let task_id = event.task_id().to_string();
        let Some(snapshot) = self.registry.get(&task_id) else {
            debug!(task_id = %task_id, "event for unknown task ignored");
            return;
        };
        if snapshot.status.is_terminal() {
            debug!(task_id = %task_id, status = %snapshot.status, "event for finished task ignored");
            return;
        }
        let model = self
            .models
            .entry(task_id.clone())
            .or_insert_with(|| ProgressModel::new(&snapshot.params));

        let applied = self
            .registry
            .update(&task_id, |task| apply_event(task, model, event, Utc::now()))
            .unwrap_or(Applied::Ignored);

        if let Applied::Finished(status) = applied {
            self.complete(&task_id, status).await;
        }
    }

    /// Times out stuck tasks and evicts expired terminal entries.
    pub async fn sweep(&mut self, now: DateTime<Utc>) {
        for task_id in self.registry.stale_task_ids(now, self.config.stale_after()) {
            let finished = self.registry.update(&task_id, |task| {
                if task.status.is_terminal() {
                    return None;
                }
                warn!(task_id = %task.task_id, last_update = %task.updated_at, "task stalled; forcing finalization");
                task.error = Some(TaskError::new(
                    ErrorCode::TaskTimeout,
                    format!(
                        "no progress for more than {} minutes",
                        self.config.stale_after_minutes
                    ),
                ));
                Some(finish(task, now))
            });
            if let Some(Some(status)) = finished {
                self.complete(&task_id, status).await;
            }
        }
        let evicted = self.registry.evict_terminal(now, self.config.retention());
        if evicted > 0 {
            debug!(evicted, "evicted expired tasks");
        }
    }

    async fn complete(&mut self, task_id: &str, status: TaskStatus) {
        self.models.remove(task_id);
        match status {
            TaskStatus::Failed => error!(task_id = %task_id, status = %status, "task finished"),
            _ => info!(task_id = %task_id, status = %status, "task finished"),
        }
        let namespace = task_namespace(&self.work_dir, task_id);
        match fs::remove_dir_all(&namespace).await {
            Ok(()) => debug!(task_id = %task_id, path = %namespace.display(), "task workspace removed"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(task_id = %task_id, path = %namespace.display(), error = %err, "failed to clean task workspace")
            }
        }
    }
}

fn apply_event(
    task: &mut Task,
    model: &mut ProgressModel,
    event: WorkerEvent,
    now: DateTime<Utc>,
) -> Applied {
    if task.status.is_terminal() {
        return Applied::Ignored;
    }
    task.updated_at = now;
    match event {
        WorkerEvent::Progress(progress) => model.update_stage(progress.stage, progress.fraction),
        WorkerEvent::Status(update) => apply_status(task, model, update),
        WorkerEvent::Fatal(fatal) => {
            for component in Component::ALL {
                let result = task.results.get_mut(component);
                if !result.status.is_terminal() {
                    result.status = ComponentStatus::Failed;
                    result.details = "aborted by task failure".into();
                    result.error = Some(fatal.error.clone());
                }
            }
            task.error = Some(fatal.error);
            task.status = TaskStatus::Failed;
            task.progress = 100;
            return Applied::Finished(TaskStatus::Failed);
        }
    }
    if task.status == TaskStatus::Queued {
        task.status = TaskStatus::Running;
    }
    task.progress = task.progress.max(model.get_total());
    if task.components_settled() {
        return Applied::Finished(finish(task, now));
    }
    Applied::Updated
}

fn apply_status(task: &mut Task, model: &mut ProgressModel, update: StatusUpdate) {
    let result = task.results.get_mut(update.component);
    if let Some(details) = update.details {
        result.details = details;
    }
    if let Some(output) = update.output {
        result.merge_output(output);
    }
    match update.status {
        Some(status) if result.status.is_terminal() && status != result.status => {
            debug!(
                task_id = %task.task_id,
                component = %update.component,
                from = %result.status,
                to = %status,
                "rejected transition out of terminal status"
            );
        }
        Some(status) => {
            result.status = status;
            if update.error.is_some() {
                result.error = update.error;
            }
            model.mark_component_terminal(update.component, status);
        }
        None => {
            if update.error.is_some() {
                result.error = update.error;
            }
        }
    }
}

/// Settles orphaned components and computes the final status.
fn finish(task: &mut Task, now: DateTime<Utc>) -> TaskStatus {
    let mut succeeded = 0;
    let mut failed = 0;
    for component in Component::ALL {
        let result = task.results.get_mut(component);
        if matches!(
            result.status,
            ComponentStatus::Pending | ComponentStatus::Running
        ) {
            result.status = ComponentStatus::Failed;
            result.details = "worker stopped before completing".into();
            result.error = Some(TaskError::new(
                ErrorCode::WorkerCrashed,
                format!("{component} did not reach a terminal state"),
            ));
        }
        match result.status {
            ComponentStatus::Success => succeeded += 1,
            ComponentStatus::Failed => failed += 1,
            _ => {}
        }
    }
    let status = match (succeeded, failed) {
        (_, 0) => TaskStatus::Success,
        (0, _) => TaskStatus::Failed,
        _ => TaskStatus::PartialSuccess,
    };
    task.status = status;
    task.progress = 100;
    task.updated_at = now;
    status
}
