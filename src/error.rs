use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Cannot load config file {path}: {source}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Provisioning task environment failed: {0}")]
    Provisioning(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Scope expansion failed: {0}")]
    Authorization(String),

    #[error("Task {0} is already running")]
    DuplicateTask(String),

    #[error("Worker at capacity ({0} tasks running)")]
    AtCapacity(usize),

    #[error("Feature {feature} failed to initialise: {reason}")]
    FeatureInit { feature: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
