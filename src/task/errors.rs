//! Error accumulation and resolution of a single task run.
//!
//! Every fallible step of a run produces a [`CommandExecutionError`] value
//! instead of returning early with a `WorkerError`. The errors are collected
//! in order in [`ExecutionErrors`], which then decides how the run is
//! reported to the queue ([`ExecutionErrors::resolution`]) and whether the
//! whole worker has to exit ([`ExecutionErrors::worker_shutdown`]).

use thiserror::Error;

use crate::task::status::{TaskStatus, TaskUpdateReason};

/// One failure that occurred while running a task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{cause}")]
pub struct CommandExecutionError {
    pub task_status: TaskStatus,
    pub reason: Option<TaskUpdateReason>,
    pub cause: String,
}

impl CommandExecutionError {
    pub fn new(
        task_status: TaskStatus,
        reason: Option<TaskUpdateReason>,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            task_status,
            reason,
            cause: cause.into(),
        }
    }

    fn errored(reason: TaskUpdateReason, cause: impl Into<String>) -> Self {
        Self::new(TaskStatus::Errored, Some(reason), cause)
    }

    /// The task author got something wrong; another run would fail the same way.
    pub fn malformed_payload(cause: impl Into<String>) -> Self {
        Self::errored(TaskUpdateReason::MalformedPayload, cause)
    }

    /// An external service needed to run or resolve the task was unreachable.
    pub fn resource_unavailable(cause: impl Into<String>) -> Self {
        Self::errored(TaskUpdateReason::ResourceUnavailable, cause)
    }

    pub fn internal_error(cause: impl Into<String>) -> Self {
        Self::errored(TaskUpdateReason::InternalError, cause)
    }

    pub fn intermittent_task(cause: impl Into<String>) -> Self {
        Self::errored(TaskUpdateReason::IntermittentTask, cause)
    }

    /// The task's own code failed.
    pub fn failure(cause: impl Into<String>) -> Self {
        Self::new(TaskStatus::Failed, None, cause)
    }

    /// The worker is going away and the run was cut short.
    pub fn worker_shutdown(cause: impl Into<String>) -> Self {
        Self::new(
            TaskStatus::Aborted,
            Some(TaskUpdateReason::WorkerShutdown),
            cause,
        )
    }

    pub fn is_worker_shutdown(&self) -> bool {
        self.task_status == TaskStatus::Aborted
            && self.reason == Some(TaskUpdateReason::WorkerShutdown)
    }
}

/// How a run is reported to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    Failed,
    Exception(TaskUpdateReason),
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Completed => write!(f, "completed"),
            Resolution::Failed => write!(f, "failed"),
            Resolution::Exception(reason) => write!(f, "exception/{}", reason),
        }
    }
}

/// Ordered, append-only list of the errors of one run.
#[derive(Debug, Default, Clone)]
pub struct ExecutionErrors {
    errors: Vec<CommandExecutionError>,
}

impl ExecutionErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: CommandExecutionError) {
        self.errors.push(err);
    }

    /// Append the error of a fallible step, if there was one.
    pub fn add(&mut self, result: Result<(), CommandExecutionError>) {
        if let Err(err) = result {
            self.push(err);
        }
    }

    pub fn occurred(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn first(&self) -> Option<&CommandExecutionError> {
        self.errors.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandExecutionError> {
        self.errors.iter()
    }

    /// The first error decides the outcome; later errors are only logged.
    pub fn resolution(&self) -> Resolution {
        match self.errors.first() {
            None => Resolution::Completed,
            Some(first) if first.task_status == TaskStatus::Failed => Resolution::Failed,
            Some(first) => {
                Resolution::Exception(first.reason.unwrap_or(TaskUpdateReason::InternalError))
            }
        }
    }

    /// True if any error, not just the first, asks for the worker to exit.
    pub fn worker_shutdown(&self) -> bool {
        self.errors.iter().any(CommandExecutionError::is_worker_shutdown)
    }
}

impl std::fmt::Display for ExecutionErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.errors.first() {
            Some(first) => write!(f, "{}", first),
            None => Ok(()),
        }
    }
}
