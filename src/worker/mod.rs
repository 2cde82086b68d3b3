//! The claim loop.
//!
//! [`WorkerContext`] owns everything the worker needs (config, queue
//! collaborators, features, environment pool, task manager) and drives the
//! process lifecycle: [`init`](WorkerContext::init), then
//! [`run`](WorkerContext::run) until an [`ExitCode`] is decided, then
//! [`shutdown`](WorkerContext::shutdown).
//!
//! Each loop iteration:
//!
//! 1. Stops if termination was requested or the deployment is outdated
//! 2. Stops if the configured number of tasks has been resolved
//! 3. Purges stale task directories and checks free disk space
//! 4. Claims at most one task and runs it on its own tokio task
//! 5. Exits on idle timeout
//! 6. Waits out the claim interval, returning early on SIGINT

pub mod executor;
pub mod gc;

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::environment::{Provisioner, TaskEnvironmentPool, UserAccounts};
use crate::error::{Result, WorkerError};
use crate::exit_code::ExitCode;
use crate::feature::{default_features, Feature};
use crate::queue::{Authorizer, ClaimWorkRequest, Queue, TaskClaim, WorkerManager};
use crate::shutdown::GracefulTermination;
use crate::task::errors::Resolution;
use crate::task::manager::{RunningTask, TaskManager};
use crate::task::run::{run_task, RunContext, RunReport};
use crate::task::status::TaskUpdateReason;
use crate::task::status_manager::TaskStatusManager;

pub use executor::{CommandExecutor, CommandOutcome, CommandSpec};

const IDLE_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// The remote services the worker talks to.
#[derive(Clone)]
pub struct Services {
    pub queue: Arc<dyn Queue>,
    pub authorizer: Arc<dyn Authorizer>,
    pub worker_manager: Arc<dyn WorkerManager>,
}

/// Sent once a run is resolved and its environment released.
#[derive(Debug)]
struct TaskCompletion {
    task_id: String,
    resolution: Option<Resolution>,
    worker_shutdown: bool,
    reboot_required: bool,
    crashed: bool,
    provision_failed: bool,
}

pub struct WorkerContext {
    config: WorkerConfig,
    services: Services,
    features: Arc<Vec<Box<dyn Feature>>>,
    pool: Arc<TaskEnvironmentPool>,
    task_manager: Arc<TaskManager>,
    user_accounts: Option<Arc<dyn UserAccounts>>,
    termination: GracefulTermination,
    interrupt: CancellationToken,
    tasks_resolved: u64,
    in_flight: usize,
    completions_tx: mpsc::UnboundedSender<TaskCompletion>,
    completions_rx: mpsc::UnboundedReceiver<TaskCompletion>,
    last_deployment_check: Instant,
    last_idle_log: Option<Instant>,
}

impl WorkerContext {
    pub fn new(config: WorkerConfig, services: Services, provisioner: Arc<dyn Provisioner>) -> Self {
        let termination = GracefulTermination::new();
        let features = default_features(&config, &termination);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            pool: Arc::new(TaskEnvironmentPool::new(provisioner, config.capacity)),
            task_manager: Arc::new(TaskManager::new(config.capacity)),
            features: Arc::new(features),
            config,
            services,
            user_accounts: None,
            termination,
            interrupt: CancellationToken::new(),
            tasks_resolved: 0,
            in_flight: 0,
            completions_tx,
            completions_rx,
            last_deployment_check: Instant::now(),
            last_idle_log: None,
        }
    }

    /// Replace the built-in features.
    pub fn with_features(mut self, features: Vec<Box<dyn Feature>>) -> Self {
        self.features = Arc::new(features);
        self
    }

    /// Purge stale task users through `accounts` as well as task directories.
    pub fn with_user_accounts(mut self, accounts: Arc<dyn UserAccounts>) -> Self {
        self.user_accounts = Some(accounts);
        self
    }

    pub fn termination(&self) -> GracefulTermination {
        self.termination.clone()
    }

    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    pub fn task_manager(&self) -> Arc<TaskManager> {
        Arc::clone(&self.task_manager)
    }

    pub fn pool(&self) -> Arc<TaskEnvironmentPool> {
        Arc::clone(&self.pool)
    }

    pub fn tasks_resolved(&self) -> u64 {
        self.tasks_resolved
    }

    fn tasks_resolved_file(&self) -> Option<&PathBuf> {
        self.config.tasks_resolved_file.as_ref()
    }

    /// Prepare the worker to claim tasks.
    ///
    /// Returns an exit code if the worker cannot start yet, which is only the
    /// case when the host must reboot first.
    pub async fn init(&mut self) -> Result<Option<ExitCode>> {
        self.config.validate()?;
        tokio::fs::create_dir_all(&self.config.tasks_dir).await?;

        let features = Arc::get_mut(&mut self.features)
            .ok_or_else(|| WorkerError::Internal("features already in use".to_string()))?;
        for feature in features.iter_mut() {
            feature
                .initialise()
                .map_err(|e| WorkerError::FeatureInit {
                    feature: feature.name().to_string(),
                    reason: e.to_string(),
                })?;
        }

        if let Some(path) = self.tasks_resolved_file().cloned() {
            self.tasks_resolved = tokio::fs::read_to_string(&path)
                .await
                .ok()
                .and_then(|data| data.trim().parse().ok())
                .unwrap_or(0);
        }

        if self.pool.initialize().await? {
            tracing::warn!("Task environment needs a reboot before the worker can start");
            return Ok(Some(ExitCode::RebootRequired));
        }
        if self.config.clean_up_task_dirs {
            self.purge().await;
        }

        tracing::info!(
            task_queue_id = %self.config.task_queue_id(),
            worker_group = %self.config.worker_group,
            worker_id = %self.config.worker_id,
            capacity = self.config.capacity,
            tasks_resolved = self.tasks_resolved,
            "Worker initialised"
        );
        Ok(None)
    }

    /// Claim and run tasks until the worker has to exit.
    pub async fn run(&mut self) -> ExitCode {
        self.last_deployment_check = Instant::now();
        loop {
            while let Ok(completion) = self.completions_rx.try_recv() {
                if let Some(code) = self.handle_completion(completion).await {
                    return code;
                }
            }
            if let Some(code) = self.check_termination().await {
                return code;
            }
            if let Some(code) = self.check_task_limit().await {
                return code;
            }

            let claim_started = Instant::now();
            if self.can_claim() && self.prepare_for_claim().await {
                if let Some(claim) = self.claim().await {
                    self.dispatch(claim);
                }
            }

            if let Some(code) = self.check_idle() {
                return code;
            }

            let deadline = claim_started + self.config.claim_interval();
            let mut termination = self.termination.subscribe();
            loop {
                tokio::select! {
                    biased;
                    _ = self.interrupt.cancelled() => {
                        tracing::info!("Worker interrupted");
                        return ExitCode::WorkerStopped;
                    }
                    Some(completion) = self.completions_rx.recv() => {
                        if let Some(code) = self.handle_completion(completion).await {
                            return code;
                        }
                    }
                    _ = termination.changed() => break,
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
        }
    }

    /// Persist state that outlives the process.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(path) = self.tasks_resolved_file() {
            tokio::fs::write(path, self.tasks_resolved.to_string()).await?;
        }
        tracing::info!(tasks_resolved = self.tasks_resolved, "Worker shut down");
        Ok(())
    }

    fn can_claim(&self) -> bool {
        let limit = self.config.number_of_tasks_to_run;
        self.task_manager.available_capacity() > 0
            && self.pool.ready_count() > 0
            && (limit == 0 || self.tasks_resolved + (self.in_flight as u64) < limit)
    }

    async fn purge(&self) {
        let accounts = self.user_accounts.as_deref();
        if let Err(e) = gc::purge(&self.config.tasks_dir, &self.pool, accounts).await {
            tracing::warn!(error = %e, "Cannot purge stale task resources");
        }
    }

    /// Garbage collect, then check there is room for another task.
    async fn prepare_for_claim(&self) -> bool {
        if self.config.clean_up_task_dirs {
            self.purge().await;
        }
        let dir = self
            .pool
            .peek()
            .map(|env| env.task_dir.clone())
            .unwrap_or_else(|| self.config.tasks_dir.clone());
        match gc::sufficient_disk_space(&dir, self.config.required_disk_space_megabytes) {
            Ok(sufficient) => sufficient,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Cannot check free disk space");
                false
            }
        }
    }

    async fn claim(&self) -> Option<TaskClaim> {
        let request = ClaimWorkRequest {
            tasks: 1,
            worker_group: self.config.worker_group.clone(),
            worker_id: self.config.worker_id.clone(),
        };
        let response = match self
            .services
            .queue
            .claim_work(&self.config.task_queue_id(), request)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot claim work");
                return None;
            }
        };
        assert!(
            response.tasks.len() <= 1,
            "queue returned {} tasks for a claim of one",
            response.tasks.len()
        );
        response.tasks.into_iter().next()
    }

    fn run_context(&self) -> RunContext {
        RunContext {
            queue: Arc::clone(&self.services.queue),
            authorizer: Arc::clone(&self.services.authorizer),
            features: Arc::clone(&self.features),
            worker_group: self.config.worker_group.clone(),
            worker_id: self.config.worker_id.clone(),
        }
    }

    /// Resolve a claim that cannot run on this worker.
    fn reject(&self, claim: TaskClaim, reason: TaskUpdateReason) {
        let status = TaskStatusManager::new(
            Arc::clone(&self.services.queue),
            claim.task_id,
            claim.run_id,
        );
        tokio::spawn(async move {
            if let Err(e) = status.report_exception(reason).await {
                tracing::error!(task_id = %status.task_id(), error = %e, "Cannot resolve rejected task");
            }
        });
    }

    fn dispatch(&mut self, claim: TaskClaim) {
        let Some(environment) = self.pool.acquire() else {
            tracing::error!(task_id = %claim.task_id, "No task environment ready for claimed task");
            self.reject(claim, TaskUpdateReason::InternalError);
            return;
        };
        let running = RunningTask::new(&claim.task_id, claim.run_id, environment.task_dir_name());
        if let Err(e) = self.task_manager.add_task(running) {
            tracing::error!(task_id = %claim.task_id, error = %e, "Cannot register claimed task");
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                if let Err(e) = pool.release(&environment).await {
                    tracing::error!(error = %e, "Cannot release task environment");
                }
            });
            self.reject(claim, TaskUpdateReason::InternalError);
            return;
        }

        tracing::info!(
            task_id = %claim.task_id,
            run_id = claim.run_id,
            task_dir = %environment.task_dir.display(),
            "Task claimed"
        );
        self.in_flight += 1;

        let status = Arc::new(TaskStatusManager::new(
            Arc::clone(&self.services.queue),
            claim.task_id.clone(),
            claim.run_id,
        ));
        let ctx = self.run_context();
        let task_manager = Arc::clone(&self.task_manager);
        let pool = Arc::clone(&self.pool);
        let completions = self.completions_tx.clone();
        let task_id = claim.task_id.clone();

        tokio::spawn(async move {
            let run = run_task(claim, Arc::clone(&environment), Arc::clone(&status), &ctx);
            let (resolution, worker_shutdown, panic) =
                match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(RunReport {
                        resolution,
                        errors,
                        panic,
                        ..
                    }) => (resolution, errors.worker_shutdown(), panic),
                    Err(payload) => {
                        if let Err(e) = status.report_exception(TaskUpdateReason::InternalError).await {
                            tracing::error!(task_id = %task_id, error = %e, "Cannot resolve crashed task");
                        }
                        (None, false, Some(payload))
                    }
                };
            let crashed = panic.is_some();
            if crashed {
                tracing::error!(task_id = %task_id, "Task run panicked");
            }

            task_manager.remove_task(&task_id);
            let (reboot_required, provision_failed) = match pool.release(&environment).await {
                Ok(reboot) => (reboot, false),
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "Cannot replace task environment");
                    (false, true)
                }
            };
            let _ = completions.send(TaskCompletion {
                task_id,
                resolution,
                worker_shutdown,
                reboot_required,
                crashed,
                provision_failed,
            });

            if let Some(payload) = panic {
                std::panic::resume_unwind(payload);
            }
        });
    }

    /// Count a finished run. Returns the exit code it calls for, if any.
    fn record_completion(&mut self, completion: &TaskCompletion) -> Option<ExitCode> {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.tasks_resolved += 1;
        tracing::info!(
            task_id = %completion.task_id,
            resolution = ?completion.resolution,
            tasks_resolved = self.tasks_resolved,
            "Task finished"
        );
        if completion.crashed || completion.provision_failed {
            Some(ExitCode::InternalError)
        } else if completion.worker_shutdown {
            Some(ExitCode::WorkerShutdown)
        } else if completion.reboot_required {
            Some(ExitCode::RebootRequired)
        } else {
            None
        }
    }

    async fn handle_completion(&mut self, completion: TaskCompletion) -> Option<ExitCode> {
        match self.record_completion(&completion) {
            Some(ExitCode::InternalError) => {
                if completion.crashed {
                    tracing::error!("Exiting after task run panicked");
                    return Some(ExitCode::InternalError);
                }
                tracing::error!("Exiting after task environment could not be replaced");
                Some(self.finish_running_tasks(ExitCode::InternalError).await)
            }
            Some(code) => Some(self.finish_running_tasks(code).await),
            None => {
                if self.config.clean_up_task_dirs {
                    self.purge().await;
                }
                None
            }
        }
    }

    /// Wait for every running task to resolve, then return `code`.
    async fn finish_running_tasks(&mut self, code: ExitCode) -> ExitCode {
        if self.in_flight > 0 {
            tracing::info!(running = self.in_flight, %code, "Waiting for running tasks before exit");
        }
        let task_manager = Arc::clone(&self.task_manager);
        tokio::select! {
            _ = self.interrupt.cancelled() => return ExitCode::WorkerStopped,
            _ = task_manager.wait_for_all() => {}
        }
        let mut exit = code;
        while self.in_flight > 0 {
            tokio::select! {
                _ = self.interrupt.cancelled() => return ExitCode::WorkerStopped,
                Some(completion) = self.completions_rx.recv() => {
                    if self.record_completion(&completion) == Some(ExitCode::InternalError) {
                        exit = ExitCode::InternalError;
                    }
                }
            }
        }
        exit
    }

    async fn check_termination(&mut self) -> Option<ExitCode> {
        if let Some(finish_tasks) = self.termination.requested() {
            tracing::info!(finish_tasks, "Graceful termination requested");
            return Some(self.finish_running_tasks(ExitCode::WorkerShutdown).await);
        }
        if self.last_deployment_check.elapsed() >= self.config.deployment_check_interval() {
            self.last_deployment_check = Instant::now();
            match self.services.worker_manager.should_terminate().await {
                Ok(true) => {
                    tracing::info!("Worker deployment is outdated, shutting down");
                    return Some(self.finish_running_tasks(ExitCode::NonCurrentDeploymentId).await);
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Cannot check for new deployment"),
            }
        }
        None
    }

    async fn check_task_limit(&mut self) -> Option<ExitCode> {
        let limit = self.config.number_of_tasks_to_run;
        if limit == 0 || self.tasks_resolved < limit {
            return None;
        }
        tracing::info!(tasks_resolved = self.tasks_resolved, limit, "Resolved all tasks this worker was asked to run");
        if let Ok(true) = self.services.worker_manager.should_terminate().await {
            return Some(ExitCode::NonCurrentDeploymentId);
        }
        Some(self.finish_running_tasks(ExitCode::TasksComplete).await)
    }

    fn check_idle(&mut self) -> Option<ExitCode> {
        if !self.task_manager.is_idle() || self.in_flight > 0 {
            self.last_idle_log = None;
            return None;
        }
        let idle_for = self.task_manager.idle_for();
        if let Some(timeout) = self.config.idle_timeout() {
            if idle_for >= timeout {
                tracing::info!(idle_secs = idle_for.as_secs(), "Idle timeout reached");
                return Some(ExitCode::IdleTimeout);
            }
        }
        let due = self
            .last_idle_log
            .map_or(true, |logged| logged.elapsed() >= IDLE_LOG_INTERVAL);
        if due {
            tracing::info!(idle_secs = idle_for.as_secs(), "No task claimed, worker idle");
            self.last_idle_log = Some(Instant::now());
        }
        None
    }
}
