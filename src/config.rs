use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkerError};

/// Worker configuration, loaded from a JSON file.
///
/// Every field has a default so a config file only needs to name the
/// settings that differ from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub provisioner_id: String,
    pub worker_type: String,
    pub worker_group: String,
    pub worker_id: String,

    /// Maximum number of tasks run concurrently.
    pub capacity: usize,

    /// Parent directory of all task directories.
    pub tasks_dir: PathBuf,

    /// Delete `task_*` directories (and task users) no longer in use.
    pub clean_up_task_dirs: bool,

    /// Exit after this many seconds without a task. 0 disables the timeout.
    pub idle_timeout_secs: u64,

    /// Exit after resolving this many tasks. 0 means run forever.
    pub number_of_tasks_to_run: u64,

    /// Free space required in `tasks_dir` before a task is claimed.
    pub required_disk_space_megabytes: u64,

    /// Minimum time between consecutive claim attempts.
    pub claim_interval_ms: u64,

    /// How often to ask the worker manager whether this worker is outdated.
    pub check_for_new_deployment_every_secs: u64,

    /// Multi-user only: task users are created without an interactive login,
    /// so no reboot is needed between tasks.
    pub headless_tasks: bool,

    /// Run task commands as the worker's own OS user.
    pub run_tasks_as_current_user: bool,

    /// Script run as each new task user right after it is created.
    pub run_after_user_creation: Option<PathBuf>,

    /// File holding the number of tasks resolved across restarts.
    pub tasks_resolved_file: Option<PathBuf>,

    pub enable_artifacts: bool,
    pub enable_os_groups: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            provisioner_id: String::new(),
            worker_type: String::new(),
            worker_group: String::new(),
            worker_id: String::new(),
            capacity: 1,
            tasks_dir: default_tasks_dir(),
            clean_up_task_dirs: true,
            idle_timeout_secs: 0,
            number_of_tasks_to_run: 0,
            required_disk_space_megabytes: 10240,
            claim_interval_ms: 5000,
            check_for_new_deployment_every_secs: 1800,
            headless_tasks: false,
            run_tasks_as_current_user: true,
            run_after_user_creation: None,
            tasks_resolved_file: None,
            enable_artifacts: true,
            enable_os_groups: true,
        }
    }
}

fn default_tasks_dir() -> PathBuf {
    std::env::current_dir()
        .map(|cwd| cwd.join("tasks"))
        .unwrap_or_else(|_| PathBuf::from("tasks"))
}

impl WorkerConfig {
    /// Load a config file, applying defaults for missing fields.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|source| WorkerError::ConfigLoad {
            path: path.display().to_string(),
            source,
        })?;
        let config: WorkerConfig = serde_json::from_str(&data)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(WorkerError::InvalidConfig(
                "capacity must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("provisionerId", &self.provisioner_id),
            ("workerType", &self.worker_type),
            ("workerGroup", &self.worker_group),
            ("workerId", &self.worker_id),
        ] {
            if value.is_empty() {
                return Err(WorkerError::InvalidConfig(format!(
                    "{} must not be empty",
                    name
                )));
            }
        }
        if self.tasks_dir.as_os_str().is_empty() {
            return Err(WorkerError::InvalidConfig(
                "tasksDir must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Queue identifier tasks are claimed from.
    pub fn task_queue_id(&self) -> String {
        format!("{}/{}", self.provisioner_id, self.worker_type)
    }

    pub fn claim_interval(&self) -> Duration {
        Duration::from_millis(self.claim_interval_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_secs))
        }
    }

    pub fn deployment_check_interval(&self) -> Duration {
        Duration::from_secs(self.check_for_new_deployment_every_secs)
    }

    pub fn with_tasks_dir(mut self, tasks_dir: impl Into<PathBuf>) -> Self {
        self.tasks_dir = tasks_dir.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identified() -> WorkerConfig {
        WorkerConfig {
            provisioner_id: "prov".to_string(),
            worker_type: "linux".to_string(),
            worker_group: "us-east-1".to_string(),
            worker_id: "i-0123".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.capacity, 1);
        assert!(cfg.clean_up_task_dirs);
        assert_eq!(cfg.idle_timeout_secs, 0);
        assert_eq!(cfg.number_of_tasks_to_run, 0);
        assert_eq!(cfg.required_disk_space_megabytes, 10240);
        assert_eq!(cfg.claim_interval(), Duration::from_secs(5));
        assert!(cfg.idle_timeout().is_none());
        assert!(cfg.run_tasks_as_current_user);
        assert!(cfg.worker_id.is_empty());
    }

    #[test]
    fn default_config_needs_identifiers() {
        let err = WorkerConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("provisionerId"));
        assert!(identified().validate().is_ok());
    }

    #[test]
    fn task_queue_id_joins_provisioner_and_worker_type() {
        assert_eq!(identified().task_queue_id(), "prov/linux");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: WorkerConfig =
            serde_json::from_str(r#"{"capacity": 4, "idleTimeoutSecs": 7}"#).unwrap();
        assert_eq!(cfg.capacity, 4);
        assert_eq!(cfg.idle_timeout(), Some(Duration::from_secs(7)));
        assert!(cfg.worker_group.is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: std::result::Result<WorkerConfig, _> =
            serde_json::from_str(r#"{"capacty": 4}"#);
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let cfg = identified().with_capacity(0);
        assert!(matches!(cfg.validate(), Err(WorkerError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_empty_worker_type() {
        let cfg = WorkerConfig {
            worker_type: String::new(),
            ..identified()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("workerType"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, r#"{
                "provisionerId": "prov",
                "workerType": "linux",
                "workerGroup": "us-east-1",
                "workerId": "w-1",
                "numberOfTasksToRun": 3
            }"#).unwrap();
        let cfg = WorkerConfig::load(&path).unwrap();
        assert_eq!(cfg.worker_id, "w-1");
        assert_eq!(cfg.number_of_tasks_to_run, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = WorkerConfig::load(Path::new("/nonexistent/worker.json")).unwrap_err();
        assert!(matches!(err, WorkerError::ConfigLoad { .. }));
    }
}
