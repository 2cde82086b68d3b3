use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::process::Command;

use crate::config::WorkerConfig;
use crate::environment::{
    OsUser, PlatformData, ProvisionOutcome, Provisioner, TaskEnvironment, LOG_DIR, TASK_PREFIX,
};
use crate::error::{Result, WorkerError};

const NEXT_TASK_USER_FILE: &str = "next-task-user.json";
const CURRENT_TASK_USER_FILE: &str = "current-task-user.json";
const LOGIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const PASSWORD_LENGTH: usize = 24;

fn new_task_name() -> String {
    let nanos = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros() * 1000);
    format!("{}{}", TASK_PREFIX, nanos)
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

fn new_task_user() -> OsUser {
    OsUser {
        name: new_task_name(),
        password: generate_password(),
    }
}

async fn create_log_dir(task_dir: &Path) -> Result<()> {
    let log_dir = task_dir.join(LOG_DIR);
    tokio::fs::create_dir_all(&log_dir).await?;
    tracing::debug!(dir = %log_dir.display(), "Created log dir");
    Ok(())
}

/// Provisions plain task directories; tasks run as the worker's own user.
#[derive(Debug, Clone)]
pub struct CurrentUserProvisioner {
    tasks_dir: PathBuf,
}

impl CurrentUserProvisioner {
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
        }
    }
}

#[async_trait]
impl Provisioner for CurrentUserProvisioner {
    async fn provision(&self) -> Result<ProvisionOutcome> {
        tokio::fs::create_dir_all(&self.tasks_dir).await?;
        let task_dir = loop {
            let candidate = self.tasks_dir.join(new_task_name());
            match tokio::fs::create_dir(&candidate).await {
                Ok(()) => break candidate,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        };
        create_log_dir(&task_dir).await?;
        tracing::info!(task_dir = %task_dir.display(), "Provisioned task environment");
        Ok(ProvisionOutcome::Ready(TaskEnvironment {
            task_dir,
            user: None,
            platform_data: PlatformData::default(),
        }))
    }
}

/// Management of the OS accounts tasks run as.
#[async_trait]
pub trait UserAccounts: Send + Sync {
    async fn create_user(&self, user: &OsUser) -> Result<()>;

    async fn delete_user(&self, name: &str) -> Result<()>;

    async fn list_users(&self) -> Result<Vec<String>>;

    async fn platform_data(&self, name: &str) -> Result<PlatformData>;

    /// Give `name` full control of `dir`.
    async fn grant_directory(&self, name: &str, dir: &Path) -> Result<()>;

    /// Block until `name` has an interactive session.
    async fn wait_for_login(&self, name: &str, timeout: Duration) -> Result<()>;
}

/// [`UserAccounts`] implemented with the standard Linux account tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandUserAccounts;

impl CommandUserAccounts {
    async fn run(program: &str, args: &[&str], stdin: Option<String>) -> Result<String> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        let mut child = command.spawn().map_err(|e| {
            WorkerError::Provisioning(format!("cannot run {}: {}", program, e))
        })?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            use tokio::io::AsyncWriteExt;
            pipe.write_all(input.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(WorkerError::Provisioning(format!(
                "{} {} exited with {}: {}",
                program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn parse_id(field: Option<&str>, what: &str, name: &str) -> Result<u32> {
    field
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| WorkerError::Provisioning(format!("cannot read {} of user {}", what, name)))
}

#[async_trait]
impl UserAccounts for CommandUserAccounts {
    async fn create_user(&self, user: &OsUser) -> Result<()> {
        Self::run(
            "useradd",
            &["--create-home", "--shell", "/bin/sh", &user.name],
            None,
        )
        .await?;
        Self::run(
            "chpasswd",
            &[],
            Some(format!("{}:{}\n", user.name, user.password)),
        )
        .await?;
        tracing::info!(user = %user.name, "Created task user");
        Ok(())
    }

    async fn delete_user(&self, name: &str) -> Result<()> {
        Self::run("userdel", &["--remove", name], None).await?;
        tracing::info!(user = name, "Deleted task user");
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<String>> {
        let passwd = Self::run("getent", &["passwd"], None).await?;
        Ok(passwd
            .lines()
            .filter_map(|line| line.split(':').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn platform_data(&self, name: &str) -> Result<PlatformData> {
        let entry = Self::run("getent", &["passwd", name], None).await?;
        let fields: Vec<&str> = entry.trim().split(':').collect();
        let uid = parse_id(fields.get(2).copied(), "uid", name)?;
        let gid = parse_id(fields.get(3).copied(), "gid", name)?;
        let groups = Self::run("id", &["-G", name], None)
            .await?
            .split_whitespace()
            .filter_map(|g| g.parse().ok())
            .collect();
        Ok(PlatformData {
            uid: Some(uid),
            gid: Some(gid),
            groups,
        })
    }

    async fn grant_directory(&self, name: &str, dir: &Path) -> Result<()> {
        let owner = format!("{}:", name);
        let dir = dir.to_string_lossy();
        Self::run("chown", &["-R", &owner, &dir], None).await?;
        Ok(())
    }

    async fn wait_for_login(&self, name: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sessions = Self::run("who", &[], None).await?;
            if sessions
                .lines()
                .any(|line| line.split_whitespace().next() == Some(name))
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WorkerError::Provisioning(format!(
                    "user {} did not log in within {:?}",
                    name, timeout
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Provisions one fresh OS user per task.
///
/// Headless hosts create the user and hand out the environment straight
/// away. Otherwise a user needs an interactive login before it can run
/// tasks: the next user is created and stored in `next-task-user.json`, and
/// the host must reboot into that user's session before it can be used.
pub struct MultiuserProvisioner {
    tasks_dir: PathBuf,
    state_dir: PathBuf,
    headless: bool,
    single_task: bool,
    run_after_user_creation: Option<PathBuf>,
    accounts: Arc<dyn UserAccounts>,
    promoted_this_boot: AtomicBool,
    next_user: Mutex<Option<String>>,
}

impl MultiuserProvisioner {
    pub fn new(config: &WorkerConfig, accounts: Arc<dyn UserAccounts>) -> Self {
        Self {
            tasks_dir: config.tasks_dir.clone(),
            state_dir: config.tasks_dir.clone(),
            headless: config.headless_tasks,
            single_task: config.number_of_tasks_to_run == 1,
            run_after_user_creation: config.run_after_user_creation.clone(),
            accounts,
            promoted_this_boot: AtomicBool::new(false),
            next_user: Mutex::new(None),
        }
    }

    /// Directory holding the stored task user credentials.
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    fn next_user_path(&self) -> PathBuf {
        self.state_dir.join(NEXT_TASK_USER_FILE)
    }

    fn set_next_user(&self, name: Option<String>) {
        *self.next_user.lock().expect("next user lock poisoned") = name;
    }

    async fn prepare_next_user(&self) -> Result<OsUser> {
        let user = new_task_user();
        self.accounts.create_user(&user).await?;
        tokio::fs::create_dir_all(&self.state_dir).await?;
        let data = serde_json::to_vec_pretty(&user)?;
        tokio::fs::write(self.next_user_path(), data).await?;
        self.set_next_user(Some(user.name.clone()));
        tracing::info!(user = %user.name, "Prepared task user for next boot");
        Ok(user)
    }

    async fn build_environment(&self, user: OsUser) -> Result<TaskEnvironment> {
        let task_dir = self.tasks_dir.join(&user.name);
        tokio::fs::create_dir_all(&task_dir).await?;
        create_log_dir(&task_dir).await?;
        tracing::info!(user = %user.name, task_dir = %task_dir.display(), "Granting task user control of task dir");
        self.accounts.grant_directory(&user.name, &task_dir).await?;
        let platform_data = self.accounts.platform_data(&user.name).await?;
        if let Some(script) = &self.run_after_user_creation {
            run_as_user(script, &task_dir, &platform_data).await?;
        }
        Ok(TaskEnvironment {
            task_dir,
            user: Some(user),
            platform_data,
        })
    }

    async fn provision_headless(&self) -> Result<ProvisionOutcome> {
        let user = new_task_user();
        self.accounts.create_user(&user).await?;
        let env = self.build_environment(user).await?;
        Ok(ProvisionOutcome::Ready(env))
    }

    async fn provision_after_login(&self) -> Result<ProvisionOutcome> {
        let next = self.next_user_path();
        if !tokio::fs::try_exists(&next).await? {
            self.prepare_next_user().await?;
            return Ok(ProvisionOutcome::RebootRequired);
        }
        // Only the user this boot logged in as can run a task.
        if self.promoted_this_boot.swap(true, Ordering::SeqCst) {
            return Ok(ProvisionOutcome::RebootRequired);
        }
        let current = self.state_dir.join(CURRENT_TASK_USER_FILE);
        tokio::fs::copy(&next, &current).await?;
        let data = tokio::fs::read(&current).await?;
        let user: OsUser = serde_json::from_slice(&data)?;
        self.set_next_user(None);
        self.accounts.wait_for_login(&user.name, LOGIN_TIMEOUT).await?;
        let env = self.build_environment(user).await?;
        if self.single_task {
            tokio::fs::remove_file(&next).await?;
            self.set_next_user(None);
        } else {
            self.prepare_next_user().await?;
        }
        Ok(ProvisionOutcome::Ready(env))
    }
}

#[async_trait]
impl Provisioner for MultiuserProvisioner {
    async fn provision(&self) -> Result<ProvisionOutcome> {
        if self.headless {
            self.provision_headless().await
        } else {
            self.provision_after_login().await
        }
    }

    fn reserved_user_names(&self) -> Vec<String> {
        self.next_user
            .lock()
            .expect("next user lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

async fn run_as_user(script: &Path, task_dir: &Path, platform: &PlatformData) -> Result<()> {
    let mut command = Command::new(script);
    command.current_dir(task_dir).kill_on_drop(true);
    if let Some(uid) = platform.uid {
        command.uid(uid);
    }
    if let Some(gid) = platform.gid {
        command.gid(gid);
    }
    let status = command.status().await.map_err(|e| {
        WorkerError::Provisioning(format!("cannot run {}: {}", script.display(), e))
    })?;
    tracing::info!(script = %script.display(), %status, "Ran post user creation script");
    if !status.success() {
        return Err(WorkerError::Provisioning(format!(
            "{} exited with {}",
            script.display(),
            status
        )));
    }
    Ok(())
}
