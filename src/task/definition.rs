use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::errors::CommandExecutionError;

/// Task definition as handed out by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub provisioner_id: String,
    pub worker_type: String,
    #[serde(default)]
    pub task_group_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub created: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskDefinition {
    /// Parse and check the worker-specific payload.
    pub fn parse_payload(&self) -> Result<Payload, CommandExecutionError> {
        let payload: Payload = serde_json::from_value(self.payload.clone()).map_err(|e| {
            CommandExecutionError::malformed_payload(format!("Invalid task payload: {}", e))
        })?;
        payload.validate()?;
        Ok(payload)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Payload {
    pub command: Vec<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Seconds the commands may run before the task is aborted.
    pub max_run_time: u64,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    #[serde(default)]
    pub on_exit_status: OnExitStatus,
    #[serde(default)]
    pub os_groups: Vec<String>,
}

impl Payload {
    fn validate(&self) -> Result<(), CommandExecutionError> {
        if self.command.is_empty() {
            return Err(CommandExecutionError::malformed_payload(
                "Task payload must contain at least one command",
            ));
        }
        if let Some(index) = self.command.iter().position(|argv| argv.is_empty()) {
            return Err(CommandExecutionError::malformed_payload(format!(
                "Command {} in task payload is empty",
                index
            )));
        }
        if self.max_run_time == 0 {
            return Err(CommandExecutionError::malformed_payload(
                "Task payload maxRunTime must be at least 1 second",
            ));
        }
        Ok(())
    }

    pub fn max_run_time(&self) -> Duration {
        Duration::from_secs(self.max_run_time)
    }

    pub fn is_intermittent_exit_code(&self, code: i64) -> bool {
        self.on_exit_status.retry.contains(&code)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    #[default]
    File,
    Directory,
}

/// An artifact declared in the task payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSpec {
    pub name: String,
    /// Path relative to the task directory.
    pub path: String,
    #[serde(default, rename = "type")]
    pub kind: ArtifactKind,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnExitStatus {
    /// Exit codes that mark the run as intermittent rather than failed.
    #[serde(default)]
    pub retry: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::status::TaskUpdateReason;
    use serde_json::json;

    fn definition(payload: serde_json::Value) -> TaskDefinition {
        let now = Utc::now();
        TaskDefinition {
            provisioner_id: "p".to_string(),
            worker_type: "w".to_string(),
            task_group_id: "g".to_string(),
            scopes: vec![],
            created: now,
            deadline: now + chrono::Duration::hours(1),
            expires: now + chrono::Duration::days(1),
            payload,
        }
    }

    #[test]
    fn parses_minimal_payload() {
        let def = definition(json!({"command": [["echo", "hi"]], "maxRunTime": 30}));
        let payload = def.parse_payload().unwrap();
        assert_eq!(payload.command, vec![vec!["echo".to_string(), "hi".to_string()]]);
        assert_eq!(payload.max_run_time(), Duration::from_secs(30));
        assert!(payload.artifacts.is_empty());
    }

    #[test]
    fn unknown_payload_field_is_malformed() {
        let def = definition(json!({"command": [["true"]], "maxRunTime": 1, "bogus": 1}));
        let err = def.parse_payload().unwrap_err();
        assert_eq!(err.reason, Some(TaskUpdateReason::MalformedPayload));
    }

    #[test]
    fn empty_command_list_is_malformed() {
        let def = definition(json!({"command": [], "maxRunTime": 1}));
        assert!(def.parse_payload().is_err());
    }

    #[test]
    fn zero_max_run_time_is_malformed() {
        let def = definition(json!({"command": [["true"]], "maxRunTime": 0}));
        let err = def.parse_payload().unwrap_err();
        assert!(err.cause.contains("maxRunTime"));
    }

    #[test]
    fn intermittent_exit_codes() {
        let def = definition(json!({
            "command": [["false"]],
            "maxRunTime": 10,
            "onExitStatus": {"retry": [36, 42]}
        }));
        let payload = def.parse_payload().unwrap();
        assert!(payload.is_intermittent_exit_code(42));
        assert!(!payload.is_intermittent_exit_code(1));
    }

    #[test]
    fn artifact_kind_defaults_to_file() {
        let def = definition(json!({
            "command": [["true"]],
            "maxRunTime": 10,
            "artifacts": [{"name": "public/out.txt", "path": "out.txt"}]
        }));
        let payload = def.parse_payload().unwrap();
        assert_eq!(payload.artifacts[0].kind, ArtifactKind::File);
        assert!(!payload.artifacts[0].optional);
    }
}
