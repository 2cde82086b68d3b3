use async_trait::async_trait;

use crate::feature::{Feature, TaskFeature};
use crate::task::errors::{CommandExecutionError, ExecutionErrors};
use crate::task::run::TaskRun;
use crate::worker::executor::{CommandExecutor, CommandSpec};

/// Runs the payload's commands, one after the other, stopping at the first
/// failure or abort.
pub struct CommandsFeature {
    executor: CommandExecutor,
}

impl CommandsFeature {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }
}

impl Feature for CommandsFeature {
    fn name(&self) -> &'static str {
        "Commands"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn is_requested(&self, _task: &TaskRun) -> bool {
        true
    }

    fn new_task_feature(&self, _task: &TaskRun) -> Box<dyn TaskFeature> {
        Box::new(CommandsTask {
            executor: self.executor.clone(),
        })
    }
}

struct CommandsTask {
    executor: CommandExecutor,
}

fn display_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("{:?}", arg)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn command_spec(task: &TaskRun, argv: &[String]) -> CommandSpec {
    let mut env = task.payload.env.clone();
    env.insert("TASK_ID".to_string(), task.task_id.clone());
    env.insert("RUN_ID".to_string(), task.run_id.to_string());
    env.insert(
        "TASK_WORKDIR".to_string(),
        task.task_dir().to_string_lossy().into_owned(),
    );
    CommandSpec {
        argv: argv.to_vec(),
        cwd: task.task_dir().to_path_buf(),
        env,
        platform: task.environment.platform_data.clone(),
    }
}

#[async_trait]
impl TaskFeature for CommandsTask {
    async fn start(&mut self, task: &TaskRun) -> Result<(), CommandExecutionError> {
        let abort = task.status.abort_token();
        for (index, argv) in task.payload.command.iter().enumerate() {
            if let Some(err) = task.status.abort_error() {
                return Err(err);
            }
            task.log
                .info(format!("Executing command {}: {}", index, display_command(argv)));
            let spec = command_spec(task, argv);
            let outcome = match self.executor.execute(&spec, &task.log, &abort).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    return Err(CommandExecutionError::internal_error(format!(
                        "Could not start command {}: {}",
                        index, e
                    )));
                }
            };
            task.log.info(format!(
                "Exit Code: {}",
                outcome
                    .exit_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "none (killed)".to_string())
            ));
            task.log
                .info(format!("Elapsed: {:.3}s", outcome.duration.as_secs_f64()));
            let exit_code = outcome.exit_code;
            let succeeded = outcome.succeeded();
            task.record_command(outcome);

            if let Some(err) = task.status.abort_error() {
                return Err(err);
            }
            if succeeded {
                continue;
            }
            return Err(match exit_code {
                Some(code) if task.payload.is_intermittent_exit_code(i64::from(code)) => {
                    CommandExecutionError::intermittent_task(format!(
                        "Command {} exited with code {}, which is listed in onExitStatus.retry",
                        index, code
                    ))
                }
                Some(code) => CommandExecutionError::failure(format!(
                    "Command {} exited with code {}",
                    index, code
                )),
                None => CommandExecutionError::failure(format!(
                    "Command {} was terminated by a signal",
                    index
                )),
            });
        }
        Ok(())
    }

    async fn stop(&mut self, _task: &TaskRun, _errors: &mut ExecutionErrors) {}
}
