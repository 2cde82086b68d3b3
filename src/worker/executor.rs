use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::environment::PlatformData;
use crate::task::log::TaskLog;

/// One command of a task, ready to spawn.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub platform: PlatformData,
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub argv: Vec<String>,
    /// `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub aborted: bool,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        !self.aborted && self.exit_code == Some(0)
    }
}

/// Spawns task commands.
///
/// Output goes straight to the task log. A command runs in the task
/// directory as the task user, if there is one, and is killed as soon as
/// the abort token is cancelled.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(
        &self,
        spec: &CommandSpec,
        log: &TaskLog,
        abort: &CancellationToken,
    ) -> std::io::Result<CommandOutcome> {
        let Some((program, args)) = spec.argv.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            ));
        };
        tracing::info!(command = ?spec.argv, cwd = %spec.cwd.display(), "Executing command");

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(log.stdio()?)
            .stderr(log.stdio()?)
            .kill_on_drop(true);
        if let Some(uid) = spec.platform.uid {
            command.uid(uid);
        }
        if let Some(gid) = spec.platform.gid {
            command.gid(gid);
        }

        let started = Instant::now();
        let mut child = command.spawn()?;
        let (status, aborted) = tokio::select! {
            status = child.wait() => (status?, false),
            _ = abort.cancelled() => {
                tracing::info!(command = ?spec.argv, "Killing aborted command");
                child.kill().await?;
                (child.wait().await?, true)
            }
        };
        let outcome = CommandOutcome {
            argv: spec.argv.clone(),
            exit_code: status.code(),
            aborted,
            duration: started.elapsed(),
        };

        tracing::info!(
            command = ?spec.argv,
            exit_code = ?outcome.exit_code,
            aborted,
            elapsed_ms = outcome.duration.as_millis() as u64,
            "Command finished"
        );
        Ok(outcome)
    }
}
