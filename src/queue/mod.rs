//! Interfaces to the services the worker talks to.
//!
//! The worker only depends on these traits; the wire protocol of the remote
//! queue is not part of this crate. [`memory`] provides an in-process
//! implementation used for local runs and tests.
//!
//! - [`Queue`]: claims work and records how runs were resolved
//! - [`Authorizer`]: expands `assume:` scopes into the scopes they grant
//! - [`WorkerManager`]: tells a worker when its deployment is outdated

pub mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::task::definition::TaskDefinition;
use crate::task::status::TaskUpdateReason;

pub use memory::{InMemoryQueue, StaticAuthorizer};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimWorkRequest {
    pub tasks: usize,
    pub worker_group: String,
    pub worker_id: String,
}

/// One claimed run of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskClaim {
    pub task_id: String,
    pub run_id: u32,
    pub task: TaskDefinition,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimWorkResponse {
    pub tasks: Vec<TaskClaim>,
}

/// A file produced by a run, to be published under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactUpload {
    pub name: String,
    pub path: PathBuf,
    pub expires: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn claim_work(
        &self,
        task_queue_id: &str,
        request: ClaimWorkRequest,
    ) -> Result<ClaimWorkResponse>;

    async fn report_completed(&self, task_id: &str, run_id: u32) -> Result<()>;

    async fn report_failed(&self, task_id: &str, run_id: u32) -> Result<()>;

    async fn report_exception(
        &self,
        task_id: &str,
        run_id: u32,
        reason: TaskUpdateReason,
    ) -> Result<()>;

    async fn create_artifact(
        &self,
        task_id: &str,
        run_id: u32,
        artifact: ArtifactUpload,
    ) -> Result<()>;
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Return `scopes` plus everything granted by the roles they assume.
    async fn expand_scopes(&self, scopes: &[String]) -> Result<Vec<String>>;
}

#[async_trait]
pub trait WorkerManager: Send + Sync {
    /// True if this worker should stop taking work and exit.
    async fn should_terminate(&self) -> Result<bool>;
}

/// Worker manager for workers that are never superseded.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticWorkerManager;

#[async_trait]
impl WorkerManager for StaticWorkerManager {
    async fn should_terminate(&self) -> Result<bool> {
        Ok(false)
    }
}
