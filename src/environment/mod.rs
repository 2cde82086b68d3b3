//! Isolated execution environments for task runs.
//!
//! A [`TaskEnvironment`] is a task directory, optionally an OS user, and the
//! credentials needed to spawn processes as that user. Environments are
//! created by a [`Provisioner`], handed out by the [`TaskEnvironmentPool`],
//! used by exactly one task and then discarded.

pub mod pool;
pub mod provisioner;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use pool::{PurgeSnapshot, TaskEnvironmentPool};
pub use provisioner::{
    CommandUserAccounts, CurrentUserProvisioner, MultiuserProvisioner, UserAccounts,
};

/// Task directories and task users share this prefix.
pub const TASK_PREFIX: &str = "task_";

/// Directory, relative to the task directory, holding the task's logs.
pub const LOG_DIR: &str = "logs";

/// An OS account created to run tasks.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OsUser {
    pub name: String,
    pub password: String,
}

impl std::fmt::Debug for OsUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsUser")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Credentials used when spawning processes for a task.
///
/// Empty when tasks run as the worker's own user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformData {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub groups: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEnvironment {
    pub task_dir: PathBuf,
    pub user: Option<OsUser>,
    pub platform_data: PlatformData,
}

impl TaskEnvironment {
    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    /// Final component of the task directory, e.g. `task_1700000000000000000`.
    pub fn task_dir_name(&self) -> String {
        self.task_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.name.as_str())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.task_dir.join(LOG_DIR)
    }
}

/// Result of provisioning one environment.
///
/// A reboot is routine on hosts that need an interactive login for each
/// task user, so it is a value rather than an error.
#[derive(Debug)]
pub enum ProvisionOutcome {
    Ready(TaskEnvironment),
    RebootRequired,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self) -> Result<ProvisionOutcome>;

    /// Users created for future environments that are not in the pool yet.
    fn reserved_user_names(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_dir_name_is_last_component() {
        let env = TaskEnvironment {
            task_dir: PathBuf::from("/var/tasks/task_123"),
            user: None,
            platform_data: PlatformData::default(),
        };
        assert_eq!(env.task_dir_name(), "task_123");
        assert_eq!(env.log_dir(), PathBuf::from("/var/tasks/task_123/logs"));
        assert!(env.user_name().is_none());
    }

    #[test]
    fn os_user_debug_hides_password() {
        let user = OsUser {
            name: "task_1".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", user).contains("hunter2"));
    }
}
