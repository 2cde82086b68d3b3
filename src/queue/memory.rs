use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Result, WorkerError};
use crate::queue::{
    ArtifactUpload, Authorizer, ClaimWorkRequest, ClaimWorkResponse, Queue, TaskClaim,
};
use crate::task::definition::TaskDefinition;
use crate::task::errors::Resolution;
use crate::task::status::TaskUpdateReason;

/// A reported resolution, in the order the queue received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionReport {
    pub task_id: String,
    pub run_id: u32,
    pub resolution: Resolution,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<TaskClaim>,
    reports: Vec<ResolutionReport>,
    artifacts: HashMap<String, Vec<ArtifactUpload>>,
}

/// In-process queue: a FIFO of scheduled tasks plus a record of everything
/// the worker reported back.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    claim_calls: AtomicUsize,
    unavailable: AtomicBool,
    upload_delay: Mutex<Duration>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a queue from a JSON file holding an array of task definitions.
    pub fn load_definitions(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let definitions: Vec<TaskDefinition> = serde_json::from_str(&data)?;
        let queue = Self::new();
        for definition in definitions {
            queue.schedule(definition);
        }
        Ok(queue)
    }

    /// Schedule a task and return its generated task id.
    pub fn schedule(&self, task: TaskDefinition) -> String {
        let task_id = Uuid::new_v4().to_string();
        self.schedule_claim(TaskClaim {
            task_id: task_id.clone(),
            run_id: 0,
            task,
        });
        task_id
    }

    pub fn schedule_claim(&self, claim: TaskClaim) {
        self.lock().pending.push_back(claim);
    }

    /// Make every report and artifact call fail, as if the service were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Hold every artifact upload for `delay` before recording it.
    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.lock().expect("upload delay lock poisoned") = delay;
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn claim_calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> Vec<ResolutionReport> {
        self.lock().reports.clone()
    }

    /// Latest resolution reported for `task_id`.
    pub fn resolution(&self, task_id: &str) -> Option<Resolution> {
        self.lock()
            .reports
            .iter()
            .rev()
            .find(|r| r.task_id == task_id)
            .map(|r| r.resolution)
    }

    pub fn artifacts(&self, task_id: &str) -> Vec<ArtifactUpload> {
        self.lock()
            .artifacts
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().expect("queue state lock poisoned")
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(WorkerError::Queue("queue service unavailable".to_string()));
        }
        Ok(())
    }

    fn record(&self, task_id: &str, run_id: u32, resolution: Resolution) -> Result<()> {
        self.check_available()?;
        self.lock().reports.push(ResolutionReport {
            task_id: task_id.to_string(),
            run_id,
            resolution,
        });
        tracing::debug!(task_id, run_id, resolution = %resolution, "Run resolved");
        Ok(())
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn claim_work(
        &self,
        task_queue_id: &str,
        request: ClaimWorkRequest,
    ) -> Result<ClaimWorkResponse> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        let mut tasks = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some(claim) = state.pending.pop_front() {
            let queue_id = format!("{}/{}", claim.task.provisioner_id, claim.task.worker_type);
            if tasks.len() < request.tasks && queue_id == task_queue_id {
                tasks.push(claim);
            } else {
                remaining.push_back(claim);
            }
        }
        state.pending = remaining;
        Ok(ClaimWorkResponse { tasks })
    }

    async fn report_completed(&self, task_id: &str, run_id: u32) -> Result<()> {
        self.record(task_id, run_id, Resolution::Completed)
    }

    async fn report_failed(&self, task_id: &str, run_id: u32) -> Result<()> {
        self.record(task_id, run_id, Resolution::Failed)
    }

    async fn report_exception(
        &self,
        task_id: &str,
        run_id: u32,
        reason: TaskUpdateReason,
    ) -> Result<()> {
        self.record(task_id, run_id, Resolution::Exception(reason))
    }

    async fn create_artifact(
        &self,
        task_id: &str,
        _run_id: u32,
        artifact: ArtifactUpload,
    ) -> Result<()> {
        self.check_available()?;
        let delay = *self.upload_delay.lock().expect("upload delay lock poisoned");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.lock()
            .artifacts
            .entry(task_id.to_string())
            .or_default()
            .push(artifact);
        Ok(())
    }
}

/// Authorizer backed by a fixed role table.
///
/// `assume:<role>` grants the scopes of `<role>`; a trailing `*` in the
/// assumed name grants every role with that prefix. Roles may assume other
/// roles.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    roles: HashMap<String, Vec<String>>,
    unavailable: AtomicBool,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: impl Into<String>, scopes: Vec<String>) -> Self {
        self.roles.insert(role.into(), scopes);
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn roles_matching(&self, assumed: &str) -> Vec<&Vec<String>> {
        match assumed.strip_suffix('*') {
            Some(prefix) => self
                .roles
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(_, scopes)| scopes)
                .collect(),
            None => self.roles.get(assumed).into_iter().collect(),
        }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn expand_scopes(&self, scopes: &[String]) -> Result<Vec<String>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(WorkerError::Authorization(
                "auth service unavailable".to_string(),
            ));
        }
        let mut expanded: BTreeSet<String> = scopes.iter().cloned().collect();
        let mut frontier: Vec<String> = scopes.to_vec();
        while let Some(scope) = frontier.pop() {
            let Some(assumed) = scope.strip_prefix("assume:") else {
                continue;
            };
            for granted in self.roles_matching(assumed).into_iter().flatten() {
                if expanded.insert(granted.clone()) {
                    frontier.push(granted.clone());
                }
            }
        }
        Ok(expanded.into_iter().collect())
    }
}
