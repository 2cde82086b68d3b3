//! Pluggable capabilities that wrap every task run.
//!
//! A [`Feature`] lives for the whole process and decides whether it applies
//! to a task. For each task it does apply to, it creates a [`TaskFeature`]
//! whose `start` and `stop` hooks bracket the run. The pipeline in
//! [`crate::task::run`] walks [`default_features`] in order, so the order
//! below is part of the behaviour:
//!
//! 1. [`OsGroupsFeature`] checks group scopes before anything can change
//!    the task user's permissions
//! 2. [`ArtifactFeature`] validates artifacts up front and publishes them in
//!    its `stop`, after everything that could produce them
//! 3. [`GracefulTerminationFeature`] and [`MaxRunTimeFeature`] arm the
//!    abort triggers. They stop before artifacts are uploaded, so a slow
//!    upload cannot abort a run whose commands already finished
//! 4. [`CommandsFeature`] runs the task's commands last

pub mod artifacts;
pub mod commands;
pub mod graceful;
pub mod max_run_time;
pub mod os_groups;

use async_trait::async_trait;

use crate::config::WorkerConfig;
use crate::scopes::ScopeExpression;
use crate::shutdown::GracefulTermination;
use crate::task::errors::{CommandExecutionError, ExecutionErrors};
use crate::task::run::TaskRun;
use crate::worker::executor::CommandExecutor;

pub use artifacts::ArtifactFeature;
pub use commands::CommandsFeature;
pub use graceful::GracefulTerminationFeature;
pub use max_run_time::MaxRunTimeFeature;
pub use os_groups::OsGroupsFeature;

/// Process-wide half of a feature.
pub trait Feature: Send + Sync {
    /// Used in task logs and in the `enable<Name>` config setting.
    fn name(&self) -> &'static str;

    /// Called once at worker start-up.
    fn initialise(&mut self) -> crate::error::Result<()> {
        Ok(())
    }

    fn is_enabled(&self) -> bool;

    fn is_requested(&self, task: &TaskRun) -> bool;

    fn new_task_feature(&self, task: &TaskRun) -> Box<dyn TaskFeature>;
}

/// Per-run half of a feature.
///
/// `stop` is called exactly once for every `start` that was called, even
/// if `start` failed.
#[async_trait]
pub trait TaskFeature: Send {
    fn required_scopes(&self) -> ScopeExpression {
        ScopeExpression::none()
    }

    /// Artifact names this feature publishes itself.
    fn reserved_artifacts(&self) -> Vec<String> {
        Vec::new()
    }

    async fn start(&mut self, task: &TaskRun) -> Result<(), CommandExecutionError>;

    async fn stop(&mut self, task: &TaskRun, errors: &mut ExecutionErrors);
}

/// The built-in features, in the order they wrap a run.
pub fn default_features(
    config: &WorkerConfig,
    termination: &GracefulTermination,
) -> Vec<Box<dyn Feature>> {
    vec![
        Box::new(OsGroupsFeature::new(config)),
        Box::new(ArtifactFeature::new(config)),
        Box::new(GracefulTerminationFeature::new(termination.clone())),
        Box::new(MaxRunTimeFeature),
        Box::new(CommandsFeature::new(CommandExecutor::new())),
    ]
}
