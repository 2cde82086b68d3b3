use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::feature::{Feature, TaskFeature};
use crate::shutdown::GracefulTermination;
use crate::task::errors::{CommandExecutionError, ExecutionErrors};
use crate::task::run::TaskRun;

/// Aborts running tasks when the worker must stop without waiting for them.
pub struct GracefulTerminationFeature {
    termination: GracefulTermination,
}

impl GracefulTerminationFeature {
    pub fn new(termination: GracefulTermination) -> Self {
        Self { termination }
    }
}

impl Feature for GracefulTerminationFeature {
    fn name(&self) -> &'static str {
        "GracefulTermination"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn is_requested(&self, _task: &TaskRun) -> bool {
        true
    }

    fn new_task_feature(&self, _task: &TaskRun) -> Box<dyn TaskFeature> {
        Box::new(GracefulTerminationTask {
            termination: self.termination.clone(),
            stop: CancellationToken::new(),
            watcher: None,
        })
    }
}

struct GracefulTerminationTask {
    termination: GracefulTermination,
    stop: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

#[async_trait]
impl TaskFeature for GracefulTerminationTask {
    async fn start(&mut self, task: &TaskRun) -> Result<(), CommandExecutionError> {
        let mut rx = self.termination.subscribe();
        let stop = self.stop.clone();
        let status = task.status.clone();
        let log = task.log.clone();
        self.watcher = Some(tokio::spawn(async move {
            loop {
                if *rx.borrow_and_update() == Some(false) {
                    log.warn("Worker is shutting down without time to finish tasks, aborting");
                    status.abort(CommandExecutionError::worker_shutdown(
                        "Worker shut down before the task completed",
                    ));
                    return;
                }
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = stop.cancelled() => return,
                }
            }
        }));
        Ok(())
    }

    async fn stop(&mut self, _task: &TaskRun, _errors: &mut ExecutionErrors) {
        self.stop.cancel();
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.await;
        }
    }
}
