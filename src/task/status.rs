use serde::{Deserialize, Serialize};

/// Lifecycle state of one task run, as tracked by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Claimed,
    Aborted,
    Cancelled,
    Succeeded,
    Failed,
    Errored,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Claimed => write!(f, "claimed"),
            TaskStatus::Aborted => write!(f, "aborted"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Errored => write!(f, "errored"),
        }
    }
}

/// Machine-readable reason attached to an exception resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskUpdateReason {
    MalformedPayload,
    InternalError,
    ResourceUnavailable,
    IntermittentTask,
    Superseded,
    Canceled,
    WorkerShutdown,
}

impl TaskUpdateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskUpdateReason::MalformedPayload => "malformed-payload",
            TaskUpdateReason::InternalError => "internal-error",
            TaskUpdateReason::ResourceUnavailable => "resource-unavailable",
            TaskUpdateReason::IntermittentTask => "intermittent-task",
            TaskUpdateReason::Superseded => "superseded",
            TaskUpdateReason::Canceled => "canceled",
            TaskUpdateReason::WorkerShutdown => "worker-shutdown",
        }
    }
}

impl std::fmt::Display for TaskUpdateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
