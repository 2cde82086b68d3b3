pub mod definition;
pub mod errors;
pub mod log;
pub mod manager;
pub mod run;
pub mod status;
pub mod status_manager;

pub use definition::{Payload, TaskDefinition};
pub use errors::{CommandExecutionError, ExecutionErrors, Resolution};
pub use log::TaskLog;
pub use manager::{RunningTask, TaskManager};
pub use run::{run_features, run_task, RunContext, RunReport, TaskRun};
pub use status::{TaskStatus, TaskUpdateReason};
pub use status_manager::TaskStatusManager;
