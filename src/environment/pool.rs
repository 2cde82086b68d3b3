use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::environment::{ProvisionOutcome, Provisioner, TaskEnvironment};
use crate::error::{Result, WorkerError};

#[derive(Debug, Default)]
struct PoolState {
    ready: Vec<Arc<TaskEnvironment>>,
    in_use: Vec<Arc<TaskEnvironment>>,
}

/// Fixed-size pool of single-use task environments.
///
/// `ready.len() + in_use.len() == size` whenever no replacement is being
/// provisioned and no reboot is pending. Environments are never reused: a
/// released environment is dropped and a fresh one provisioned in its place.
pub struct TaskEnvironmentPool {
    provisioner: Arc<dyn Provisioner>,
    size: usize,
    state: Mutex<PoolState>,
    /// Held shared while provisioning, exclusively while purging, so a
    /// purge never sees a directory that is not yet in the pool.
    provisioning: RwLock<()>,
}

/// Resources in use by the pool, valid for as long as the snapshot is held.
pub struct PurgeSnapshot<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    pub task_dir_names: Vec<String>,
    pub user_names: Vec<String>,
}

impl TaskEnvironmentPool {
    pub fn new(provisioner: Arc<dyn Provisioner>, size: usize) -> Self {
        Self {
            provisioner,
            size,
            state: Mutex::new(PoolState::default()),
            provisioning: RwLock::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("environment pool lock poisoned")
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ready_count(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.lock().in_use.len()
    }

    /// Provision environments until the pool is full.
    ///
    /// Returns `true` if a reboot is required before the pool can be filled;
    /// provisioning stops at that point.
    pub async fn initialize(&self) -> Result<bool> {
        let _provisioning = self.provisioning.read().await;
        loop {
            let have = {
                let state = self.lock();
                state.ready.len() + state.in_use.len()
            };
            if have >= self.size {
                return Ok(false);
            }
            match self.provisioner.provision().await? {
                ProvisionOutcome::Ready(env) => self.lock().ready.push(Arc::new(env)),
                ProvisionOutcome::RebootRequired => {
                    tracing::info!(ready = have, size = self.size, "Reboot required to fill environment pool");
                    return Ok(true);
                }
            }
        }
    }

    /// Take a ready environment for exclusive use by one task.
    ///
    /// Returns `None` when nothing is ready; checking and taking happen under
    /// one lock.
    pub fn acquire(&self) -> Option<Arc<TaskEnvironment>> {
        let mut state = self.lock();
        let env = state.ready.pop()?;
        state.in_use.push(Arc::clone(&env));
        Some(env)
    }

    /// Retire `env` and provision its replacement.
    ///
    /// Returns `true` if the replacement requires a reboot, in which case the
    /// pool stays one environment short.
    pub async fn release(&self, env: &Arc<TaskEnvironment>) -> Result<bool> {
        let _provisioning = self.provisioning.read().await;
        {
            let mut state = self.lock();
            let index = state
                .in_use
                .iter()
                .position(|candidate| Arc::ptr_eq(candidate, env))
                .ok_or_else(|| {
                    WorkerError::Internal(format!(
                        "released environment {} is not in use",
                        env.task_dir.display()
                    ))
                })?;
            state.in_use.swap_remove(index);
        }
        match self.provisioner.provision().await? {
            ProvisionOutcome::Ready(replacement) => {
                self.lock().ready.push(Arc::new(replacement));
                Ok(false)
            }
            ProvisionOutcome::RebootRequired => Ok(true),
        }
    }

    /// A ready environment if there is one, otherwise one in use. Nothing is
    /// consumed.
    pub fn peek(&self) -> Option<Arc<TaskEnvironment>> {
        let state = self.lock();
        state
            .ready
            .last()
            .or_else(|| state.in_use.last())
            .cloned()
    }

    pub fn active_task_dir_names(&self) -> Vec<String> {
        let state = self.lock();
        state
            .ready
            .iter()
            .chain(state.in_use.iter())
            .map(|env| env.task_dir_name())
            .collect()
    }

    pub fn active_user_names(&self) -> Vec<String> {
        let state = self.lock();
        state
            .ready
            .iter()
            .chain(state.in_use.iter())
            .filter_map(|env| env.user_name().map(str::to_string))
            .collect()
    }

    /// Wait for in-flight provisioning to finish and block new provisioning
    /// while the returned snapshot is alive.
    pub async fn purge_snapshot(&self) -> PurgeSnapshot<'_> {
        let guard = self.provisioning.write().await;
        let mut user_names = self.active_user_names();
        user_names.extend(self.provisioner.reserved_user_names());
        PurgeSnapshot {
            _guard: guard,
            task_dir_names: self.active_task_dir_names(),
            user_names,
        }
    }
}
