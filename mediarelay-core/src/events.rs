use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::progress::Stage;
use crate::task::{Component, ComponentStatus, TaskError, TaskId};

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub stage: Stage,
    pub fraction: f64,
}

/// Partial component update. Absent fields leave the stored value untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub task_id: TaskId,
    pub component: Component,
    pub status: Option<ComponentStatus>,
    pub details: Option<String>,
    pub output: Option<Map<String, Value>>,
    pub error: Option<TaskError>,
}

impl StatusUpdate {
    pub fn new(task_id: impl Into<TaskId>, component: Component) -> Self {
        Self {
            task_id: task_id.into(),
            component,
            status: None,
            details: None,
            output: None,
            error: None,
        }
    }

    pub fn status(mut self, status: ComponentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn output(mut self, output: Map<String, Value>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn error(mut self, error: TaskError) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FatalEvent {
    pub task_id: TaskId,
    pub error: TaskError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Progress(ProgressEvent),
    Status(StatusUpdate),
    Fatal(FatalEvent),
}

impl WorkerEvent {
    pub fn task_id(&self) -> &str {
        match self {
            WorkerEvent::Progress(event) => &event.task_id,
            WorkerEvent::Status(event) => &event.task_id,
            WorkerEvent::Fatal(event) => &event.task_id,
        }
    }
}

/// Result-queue handle bound to one task.
#[derive(Debug, Clone)]
pub struct EventSender {
    task_id: TaskId,
    tx: UnboundedSender<WorkerEvent>,
}

impl EventSender {
    pub fn new(task_id: impl Into<TaskId>, tx: UnboundedSender<WorkerEvent>) -> Self {
        Self {
            task_id: task_id.into(),
            tx,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn progress(&self, stage: Stage, fraction: f64) {
        self.send(WorkerEvent::Progress(ProgressEvent {
            task_id: self.task_id.clone(),
            stage,
            fraction,
        }));
    }

    /// Starts a partial update for `component`; finish with [`EventSender::send_status`].
    pub fn update(&self, component: Component) -> StatusUpdate {
        StatusUpdate::new(self.task_id.clone(), component)
    }

    pub fn send_status(&self, update: StatusUpdate) {
        self.send(WorkerEvent::Status(update));
    }

    pub fn fatal(&self, error: TaskError) {
        self.send(WorkerEvent::Fatal(FatalEvent {
            task_id: self.task_id.clone(),
            error,
        }));
    }

    fn send(&self, event: WorkerEvent) {
        if self.tx.send(event).is_err() {
            debug!(task_id = %self.task_id, "result queue closed; dropping event");
        }
    }
}
