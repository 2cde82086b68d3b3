use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Result, WorkerError};

/// A task registered as running.
#[derive(Debug, Clone)]
pub struct RunningTask {
    pub task_id: String,
    pub run_id: u32,
    pub task_dir_name: String,
    pub started: DateTime<Utc>,
}

impl RunningTask {
    pub fn new(task_id: impl Into<String>, run_id: u32, task_dir_name: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            run_id,
            task_dir_name: task_dir_name.into(),
            started: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct ManagerState {
    running: HashMap<String, RunningTask>,
    last_active: Instant,
    last_active_at: DateTime<Utc>,
}

impl ManagerState {
    fn touch(&mut self) {
        self.last_active = Instant::now();
        self.last_active_at = Utc::now();
    }
}

/// Capacity-bounded registry of running tasks.
pub struct TaskManager {
    capacity: usize,
    state: Mutex<ManagerState>,
    count: watch::Sender<usize>,
}

impl TaskManager {
    pub fn new(capacity: usize) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            capacity,
            state: Mutex::new(ManagerState {
                running: HashMap::new(),
                last_active: Instant::now(),
                last_active_at: Utc::now(),
            }),
            count,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().expect("task manager lock poisoned")
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.lock().running.len())
    }

    /// Register a task. Must be called before the task starts any work.
    pub fn add_task(&self, task: RunningTask) -> Result<()> {
        let mut state = self.lock();
        if state.running.contains_key(&task.task_id) {
            return Err(WorkerError::DuplicateTask(task.task_id));
        }
        if state.running.len() >= self.capacity {
            return Err(WorkerError::AtCapacity(state.running.len()));
        }
        tracing::debug!(task_id = %task.task_id, run_id = task.run_id, "Task registered");
        state.running.insert(task.task_id.clone(), task);
        state.touch();
        self.count.send_replace(state.running.len());
        Ok(())
    }

    /// Unregister a task. Removing a task that is not running does nothing.
    pub fn remove_task(&self, task_id: &str) -> Option<RunningTask> {
        let mut state = self.lock();
        let removed = state.running.remove(task_id)?;
        state.touch();
        self.count.send_replace(state.running.len());
        Some(removed)
    }

    pub fn task_count(&self) -> usize {
        self.lock().running.len()
    }

    pub fn is_idle(&self) -> bool {
        self.lock().running.is_empty()
    }

    /// When a task was last added or removed, or the manager created.
    pub fn last_active(&self) -> Instant {
        self.lock().last_active
    }

    /// Time since the last add or remove.
    ///
    /// The monotonic clock stops while the host is suspended, so the
    /// wall-clock gap is taken when it is larger.
    pub fn idle_for(&self) -> Duration {
        self.idle_for_at(Utc::now())
    }

    fn idle_for_at(&self, now: DateTime<Utc>) -> Duration {
        let state = self.lock();
        let monotonic = state.last_active.elapsed();
        let wall = (now - state.last_active_at).to_std().unwrap_or_default();
        monotonic.max(wall)
    }

    pub fn running_tasks(&self) -> Vec<RunningTask> {
        self.lock().running.values().cloned().collect()
    }

    pub fn running_task_dir_names(&self) -> Vec<String> {
        self.lock()
            .running
            .values()
            .map(|task| task.task_dir_name.clone())
            .collect()
    }

    /// Wait until no task is registered.
    pub async fn wait_for_all(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}
