use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::queue::Queue;
use crate::task::errors::{CommandExecutionError, ExecutionErrors, Resolution};
use crate::task::status::{TaskStatus, TaskUpdateReason};

#[derive(Debug)]
struct StatusState {
    status: TaskStatus,
    abort_error: Option<CommandExecutionError>,
    resolved: bool,
}

/// Owns the status of one run and its single resolution call to the queue.
///
/// Features abort the run through [`abort`](Self::abort); the abort token
/// is cancelled so a command in progress is killed, and the first abort
/// error is kept for the command runner to report.
pub struct TaskStatusManager {
    queue: Arc<dyn Queue>,
    task_id: String,
    run_id: u32,
    state: Mutex<StatusState>,
    abort_token: CancellationToken,
}

impl TaskStatusManager {
    pub fn new(queue: Arc<dyn Queue>, task_id: impl Into<String>, run_id: u32) -> Self {
        Self {
            queue,
            task_id: task_id.into(),
            run_id,
            state: Mutex::new(StatusState {
                status: TaskStatus::Claimed,
                abort_error: None,
                resolved: false,
            }),
            abort_token: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusState> {
        self.state.lock().expect("task status lock poisoned")
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn run_id(&self) -> u32 {
        self.run_id
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    pub fn abort(&self, err: CommandExecutionError) {
        {
            let mut state = self.lock();
            if state.resolved {
                return;
            }
            if state.abort_error.is_none() {
                tracing::info!(task_id = %self.task_id, cause = %err, "Aborting task");
                state.abort_error = Some(err);
            }
            state.status = TaskStatus::Aborted;
        }
        self.abort_token.cancel();
    }

    pub fn abort_error(&self) -> Option<CommandExecutionError> {
        self.lock().abort_error.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_token.is_cancelled()
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.abort_token.clone()
    }

    /// Mark the run resolved. Returns false if it already was.
    fn begin_resolution(&self, status: TaskStatus) -> bool {
        let mut state = self.lock();
        if state.resolved {
            return false;
        }
        state.resolved = true;
        if state.status != TaskStatus::Aborted {
            state.status = status;
        }
        true
    }

    fn undo_resolution(&self) {
        self.lock().resolved = false;
    }

    pub async fn report_completed(&self) -> Result<()> {
        self.report(Resolution::Completed).await
    }

    pub async fn report_failed(&self) -> Result<()> {
        self.report(Resolution::Failed).await
    }

    pub async fn report_exception(&self, reason: TaskUpdateReason) -> Result<()> {
        self.report(Resolution::Exception(reason)).await
    }

    /// Report the resolution `errors` call for.
    pub async fn resolve(&self, errors: &ExecutionErrors) -> Result<Resolution> {
        let resolution = errors.resolution();
        self.report(resolution).await?;
        Ok(resolution)
    }

    async fn report(&self, resolution: Resolution) -> Result<()> {
        let status = match resolution {
            Resolution::Completed => TaskStatus::Succeeded,
            Resolution::Failed => TaskStatus::Failed,
            Resolution::Exception(_) => TaskStatus::Errored,
        };
        if !self.begin_resolution(status) {
            tracing::debug!(task_id = %self.task_id, %resolution, "Run already resolved");
            return Ok(());
        }
        let result = match resolution {
            Resolution::Completed => self.queue.report_completed(&self.task_id, self.run_id).await,
            Resolution::Failed => self.queue.report_failed(&self.task_id, self.run_id).await,
            Resolution::Exception(reason) => {
                self.queue
                    .report_exception(&self.task_id, self.run_id, reason)
                    .await
            }
        };
        if let Err(e) = result {
            self.undo_resolution();
            return Err(e);
        }
        tracing::info!(task_id = %self.task_id, run_id = self.run_id, %resolution, "Task resolved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;

    fn manager() -> (Arc<InMemoryQueue>, TaskStatusManager) {
        let queue = Arc::new(InMemoryQueue::new());
        let status = TaskStatusManager::new(queue.clone(), "task-1", 0);
        (queue, status)
    }

    #[tokio::test]
    async fn first_abort_error_wins() {
        let (_queue, status) = manager();
        status.abort(CommandExecutionError::failure("max run time exceeded"));
        status.abort(CommandExecutionError::worker_shutdown("terminating"));
        assert!(status.is_aborted());
        assert_eq!(status.status(), TaskStatus::Aborted);
        assert_eq!(status.abort_error().unwrap().cause, "max run time exceeded");
    }

    #[tokio::test]
    async fn second_resolution_is_a_no_op() {
        let (queue, status) = manager();
        status.report_failed().await.unwrap();
        status.report_completed().await.unwrap();
        assert_eq!(queue.reports().len(), 1);
        assert_eq!(queue.resolution("task-1"), Some(Resolution::Failed));
        assert_eq!(status.status(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn failed_report_can_be_retried() {
        let (queue, status) = manager();
        queue.set_unavailable(true);
        assert!(status.report_completed().await.is_err());
        queue.set_unavailable(false);
        status.report_completed().await.unwrap();
        assert_eq!(queue.resolution("task-1"), Some(Resolution::Completed));
    }

    #[tokio::test]
    async fn abort_after_resolution_is_ignored() {
        let (_queue, status) = manager();
        status.report_completed().await.unwrap();
        status.abort(CommandExecutionError::worker_shutdown("late"));
        assert!(!status.is_aborted());
        assert_eq!(status.status(), TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn resolve_uses_error_priority() {
        let (queue, status) = manager();
        let mut errors = ExecutionErrors::new();
        errors.push(CommandExecutionError::malformed_payload("bad"));
        let resolution = status.resolve(&errors).await.unwrap();
        assert_eq!(
            resolution,
            Resolution::Exception(TaskUpdateReason::MalformedPayload)
        );
        assert_eq!(queue.resolution("task-1"), Some(resolution));
    }
}
