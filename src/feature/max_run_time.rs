use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::feature::{Feature, TaskFeature};
use crate::task::errors::{CommandExecutionError, ExecutionErrors};
use crate::task::run::TaskRun;

/// Fails the task once it has run for the payload's `maxRunTime`.
pub struct MaxRunTimeFeature;

impl Feature for MaxRunTimeFeature {
    fn name(&self) -> &'static str {
        "MaxRunTime"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn is_requested(&self, _task: &TaskRun) -> bool {
        true
    }

    fn new_task_feature(&self, _task: &TaskRun) -> Box<dyn TaskFeature> {
        Box::new(MaxRunTimeTask {
            stop: CancellationToken::new(),
            timer: None,
        })
    }
}

struct MaxRunTimeTask {
    stop: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

#[async_trait]
impl TaskFeature for MaxRunTimeTask {
    async fn start(&mut self, task: &TaskRun) -> Result<(), CommandExecutionError> {
        let max_run_time = task.payload.max_run_time();
        let stop = self.stop.clone();
        let status = task.status.clone();
        let log = task.log.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(max_run_time) => {
                    log.error(format!(
                        "Aborting task: max run time of {} seconds exceeded",
                        max_run_time.as_secs()
                    ));
                    status.abort(CommandExecutionError::failure("max run time exceeded"));
                }
                _ = stop.cancelled() => {}
            }
        }));
        Ok(())
    }

    async fn stop(&mut self, _task: &TaskRun, _errors: &mut ExecutionErrors) {
        self.stop.cancel();
        if let Some(timer) = self.timer.take() {
            let _ = timer.await;
        }
    }
}
