//! One claimed run of a task, and the pipeline that executes it.
//!
//! [`run_task`] opens the task log, parses the payload, walks the feature
//! pipeline ([`run_features`]), publishes the log and resolves the run with
//! the queue. Every failure on the way becomes an entry in
//! [`ExecutionErrors`]; nothing is returned early as a `WorkerError`.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::FutureExt;

use crate::environment::TaskEnvironment;
use crate::feature::{Feature, TaskFeature};
use crate::queue::{ArtifactUpload, Authorizer, Queue, TaskClaim};
use crate::scopes;
use crate::task::definition::{Payload, TaskDefinition};
use crate::task::errors::{CommandExecutionError, ExecutionErrors, Resolution};
use crate::task::log::{TaskLog, LOG_ARTIFACT_NAME};
use crate::task::status_manager::TaskStatusManager;
use crate::worker::executor::CommandOutcome;

/// Owner of the backing log artifact.
const BACKING_LOG_OWNER: &str = "BackingLog";

pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// A claimed task bound to its environment.
pub struct TaskRun {
    pub task_id: String,
    pub run_id: u32,
    pub task_group_id: String,
    pub definition: TaskDefinition,
    pub payload: Payload,
    pub environment: Arc<TaskEnvironment>,
    pub log: Arc<TaskLog>,
    pub status: Arc<TaskStatusManager>,
    pub queue: Arc<dyn Queue>,
    feature_artifacts: Mutex<BTreeMap<String, String>>,
    commands: Mutex<Vec<CommandOutcome>>,
    os_groups: Mutex<Vec<String>>,
}

impl TaskRun {
    pub fn new(
        claim: TaskClaim,
        payload: Payload,
        environment: Arc<TaskEnvironment>,
        log: Arc<TaskLog>,
        status: Arc<TaskStatusManager>,
        queue: Arc<dyn Queue>,
    ) -> Self {
        let mut feature_artifacts = BTreeMap::new();
        feature_artifacts.insert(LOG_ARTIFACT_NAME.to_string(), BACKING_LOG_OWNER.to_string());
        Self {
            task_id: claim.task_id,
            run_id: claim.run_id,
            task_group_id: claim.task.task_group_id.clone(),
            definition: claim.task,
            payload,
            environment,
            log,
            status,
            queue,
            feature_artifacts: Mutex::new(feature_artifacts),
            commands: Mutex::new(Vec::new()),
            os_groups: Mutex::new(Vec::new()),
        }
    }

    pub fn task_dir(&self) -> &Path {
        self.environment.task_dir()
    }

    /// Claim artifact names for `feature`. Fails without claiming anything
    /// if another feature already holds one of them.
    pub fn reserve_artifacts(
        &self,
        feature: &str,
        names: &[String],
    ) -> Result<(), CommandExecutionError> {
        let mut reserved = self.feature_artifacts.lock().expect("artifact lock poisoned");
        for name in names {
            if let Some(owner) = reserved.get(name) {
                if owner != feature {
                    return Err(CommandExecutionError::malformed_payload(format!(
                        "Feature {} cannot reserve artifact {} since it is already reserved by feature {}",
                        feature, name, owner
                    )));
                }
            }
        }
        for name in names {
            reserved.insert(name.clone(), feature.to_string());
        }
        Ok(())
    }

    /// The feature that reserved artifact `name`, if any.
    pub fn artifact_owner(&self, name: &str) -> Option<String> {
        self.feature_artifacts
            .lock()
            .expect("artifact lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn record_command(&self, outcome: CommandOutcome) {
        self.commands
            .lock()
            .expect("command list lock poisoned")
            .push(outcome);
    }

    /// Commands run so far, in order.
    pub fn commands(&self) -> Vec<CommandOutcome> {
        self.commands
            .lock()
            .expect("command list lock poisoned")
            .clone()
    }

    pub fn set_os_groups(&self, groups: Vec<String>) {
        *self.os_groups.lock().expect("os groups lock poisoned") = groups;
    }

    pub fn os_groups(&self) -> Vec<String> {
        self.os_groups.lock().expect("os groups lock poisoned").clone()
    }
}

/// Errors of a pipeline walk, plus the first panic caught in a hook.
pub struct PipelineReport {
    pub errors: ExecutionErrors,
    pub panic: Option<PanicPayload>,
}

fn panic_message(payload: &PanicPayload) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Walk `features` in order around `task`.
///
/// The first failure stops the walk. Every started feature is stopped, in
/// reverse order, whatever happened after it started; a panic in one hook
/// is recorded and the remaining stops still run.
pub async fn run_features(
    task: &TaskRun,
    features: &[Box<dyn Feature>],
    authorizer: &dyn Authorizer,
) -> PipelineReport {
    let mut errors = ExecutionErrors::new();
    let mut panic = None;
    let mut started: Vec<(&'static str, Box<dyn TaskFeature>)> = Vec::new();

    for feature in features {
        let name = feature.name();
        if !feature.is_requested(task) {
            continue;
        }
        if !feature.is_enabled() {
            errors.push(CommandExecutionError::malformed_payload(format!(
                "This task requires feature {name}, which is disabled on this worker. \
                 Enable it with the enable{name} config setting, or remove its use from the task payload."
            )));
            break;
        }

        let mut task_feature = feature.new_task_feature(task);

        let required = task_feature.required_scopes();
        match scopes::satisfied(&required, &task.definition.scopes, authorizer).await {
            Ok(true) => {}
            Ok(false) => {
                errors.push(CommandExecutionError::malformed_payload(format!(
                    "Feature {} requires task scopes {}, but the task only has scopes [{}]",
                    name,
                    required,
                    task.definition.scopes.join(", ")
                )));
                break;
            }
            Err(e) => {
                errors.push(CommandExecutionError::resource_unavailable(format!(
                    "Could not check scopes required by feature {}: {}",
                    name, e
                )));
                break;
            }
        }

        if let Err(e) = task.reserve_artifacts(name, &task_feature.reserved_artifacts()) {
            errors.push(e);
            break;
        }

        tracing::debug!(task_id = %task.task_id, feature = name, "Starting feature");
        let result = AssertUnwindSafe(task_feature.start(task))
            .catch_unwind()
            .await;
        started.push((name, task_feature));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                errors.push(e);
                break;
            }
            Err(payload) => {
                errors.push(CommandExecutionError::internal_error(format!(
                    "Feature {} panicked while starting: {}",
                    name,
                    panic_message(&payload)
                )));
                panic = Some(payload);
                break;
            }
        }
    }

    while let Some((name, mut task_feature)) = started.pop() {
        tracing::debug!(task_id = %task.task_id, feature = name, "Stopping feature");
        let result = AssertUnwindSafe(task_feature.stop(task, &mut errors))
            .catch_unwind()
            .await;
        if let Err(payload) = result {
            errors.push(CommandExecutionError::internal_error(format!(
                "Feature {} panicked while stopping: {}",
                name,
                panic_message(&payload)
            )));
            panic.get_or_insert(payload);
        }
    }

    PipelineReport { errors, panic }
}

/// Shared collaborators of every run.
#[derive(Clone)]
pub struct RunContext {
    pub queue: Arc<dyn Queue>,
    pub authorizer: Arc<dyn Authorizer>,
    pub features: Arc<Vec<Box<dyn Feature>>>,
    pub worker_group: String,
    pub worker_id: String,
}

/// What happened to one run.
pub struct RunReport {
    pub task_id: String,
    /// `None` if the queue could not be told.
    pub resolution: Option<Resolution>,
    pub errors: ExecutionErrors,
    pub panic: Option<PanicPayload>,
}

impl RunReport {
    pub fn worker_shutdown(&self) -> bool {
        self.errors.worker_shutdown()
    }
}

/// Execute a claimed task in `environment` and resolve it.
pub async fn run_task(
    claim: TaskClaim,
    environment: Arc<TaskEnvironment>,
    status: Arc<TaskStatusManager>,
    ctx: &RunContext,
) -> RunReport {
    let mut report = RunReport {
        task_id: claim.task_id.clone(),
        resolution: None,
        errors: ExecutionErrors::new(),
        panic: None,
    };

    let log = match TaskLog::create(environment.task_dir()) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            tracing::error!(task_id = %claim.task_id, error = %e, "Cannot create task log");
            report.errors.push(CommandExecutionError::internal_error(format!(
                "Cannot create task log: {}",
                e
            )));
            report.resolution = resolve(&status, &report.errors).await;
            return report;
        }
    };

    log.info(format!("Worker Group: {}", ctx.worker_group));
    log.info(format!("Worker ID: {}", ctx.worker_id));
    log.info(format!("Task ID: {} Run ID: {}", claim.task_id, claim.run_id));
    log.info(format!("Task dir: {}", environment.task_dir().display()));
    if let Some(user) = environment.user_name() {
        log.info(format!("Task user: {}", user));
    }

    let expires = claim.task.expires;
    match claim.task.parse_payload() {
        Ok(payload) => {
            let task = TaskRun::new(
                claim,
                payload,
                environment,
                Arc::clone(&log),
                Arc::clone(&status),
                Arc::clone(&ctx.queue),
            );
            let pipeline = run_features(&task, &ctx.features, ctx.authorizer.as_ref()).await;
            report.errors = pipeline.errors;
            report.panic = pipeline.panic;
        }
        Err(e) => report.errors.push(e),
    }

    if let Some(abort) = status.abort_error() {
        if !report.errors.iter().any(|err| *err == abort) {
            report.errors.push(abort);
        }
    }

    for err in report.errors.iter() {
        log.error(err.to_string());
    }
    log.info(format!("=== Task Finished: {} ===", report.errors.resolution()));

    let upload = ArtifactUpload {
        name: LOG_ARTIFACT_NAME.to_string(),
        path: log.path().to_path_buf(),
        expires: Some(expires),
    };
    if let Err(e) = ctx
        .queue
        .create_artifact(&report.task_id, status.run_id(), upload)
        .await
    {
        tracing::warn!(task_id = %report.task_id, error = %e, "Cannot publish task log");
        report.errors.push(CommandExecutionError::resource_unavailable(format!(
            "Cannot publish task log: {}",
            e
        )));
    }

    report.resolution = resolve(&status, &report.errors).await;
    report
}

async fn resolve(status: &TaskStatusManager, errors: &ExecutionErrors) -> Option<Resolution> {
    match status.resolve(errors).await {
        Ok(resolution) => Some(resolution),
        Err(e) => {
            tracing::error!(task_id = %status.task_id(), error = %e, "Cannot resolve task");
            None
        }
    }
}
