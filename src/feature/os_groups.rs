use async_trait::async_trait;

use crate::config::WorkerConfig;
use crate::feature::{Feature, TaskFeature};
use crate::scopes::ScopeExpression;
use crate::task::errors::{CommandExecutionError, ExecutionErrors};
use crate::task::run::TaskRun;

/// Adds the task user to the OS groups listed in the payload.
pub struct OsGroupsFeature {
    enabled: bool,
    run_as_current_user: bool,
}

impl OsGroupsFeature {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            enabled: config.enable_os_groups,
            run_as_current_user: config.run_tasks_as_current_user,
        }
    }
}

impl Feature for OsGroupsFeature {
    fn name(&self) -> &'static str {
        "OsGroups"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_requested(&self, task: &TaskRun) -> bool {
        !task.payload.os_groups.is_empty()
    }

    fn new_task_feature(&self, task: &TaskRun) -> Box<dyn TaskFeature> {
        Box::new(OsGroupsTask {
            groups: task.payload.os_groups.clone(),
            scope_prefix: format!(
                "fleet-worker:os-group:{}/{}/",
                task.definition.provisioner_id, task.definition.worker_type
            ),
            run_as_current_user: self.run_as_current_user,
            granted: false,
        })
    }
}

struct OsGroupsTask {
    groups: Vec<String>,
    scope_prefix: String,
    run_as_current_user: bool,
    granted: bool,
}

#[async_trait]
impl TaskFeature for OsGroupsTask {
    fn required_scopes(&self) -> ScopeExpression {
        ScopeExpression::all_of(
            self.groups
                .iter()
                .map(|group| format!("{}{}", self.scope_prefix, group))
                .collect(),
        )
    }

    async fn start(&mut self, task: &TaskRun) -> Result<(), CommandExecutionError> {
        if self.run_as_current_user {
            return Err(CommandExecutionError::malformed_payload(format!(
                "This worker runs tasks as its own user, so it cannot add the task user to OS groups [{}]",
                self.groups.join(", ")
            )));
        }
        task.log
            .info(format!("Adding task user to OS groups: {}", self.groups.join(", ")));
        task.set_os_groups(self.groups.clone());
        self.granted = true;
        Ok(())
    }

    async fn stop(&mut self, task: &TaskRun, _errors: &mut ExecutionErrors) {
        if self.granted {
            task.log.info(format!(
                "Removing task user from OS groups: {}",
                self.groups.join(", ")
            ));
        }
    }
}
