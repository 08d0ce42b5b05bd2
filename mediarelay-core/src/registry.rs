use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use crate::task::{Task, TaskId};

/// Shared task table. Every call holds the lock for a single operation.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Mutex<HashMap<TaskId, Task>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        self.lock().insert(task.task_id.clone(), task);
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.lock().get(task_id).cloned()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    pub fn remove(&self, task_id: &str) -> Option<Task> {
        self.lock().remove(task_id)
    }

    /// Applies `mutate` to the stored task, if present.
    pub fn update<F, R>(&self, task_id: &str, mutate: F) -> Option<R>
    where
        F: FnOnce(&mut Task) -> R,
    {
        self.lock().get_mut(task_id).map(mutate)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Non-terminal tasks whose last update is older than `stale_after`.
    pub fn stale_task_ids(&self, now: DateTime<Utc>, stale_after: Duration) -> Vec<TaskId> {
        self.lock()
            .values()
            .filter(|task| !task.status.is_terminal() && now - task.updated_at > stale_after)
            .map(|task| task.task_id.clone())
            .collect()
    }

    /// Drops terminal tasks older than `retention`; returns how many were removed.
    pub fn evict_terminal(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|_, task| !(task.status.is_terminal() && now - task.updated_at > retention));
        before - guard.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Task>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
