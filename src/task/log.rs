use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};

/// Name the backing log is published under.
pub const LOG_ARTIFACT_NAME: &str = "public/logs/live_backing.log";

/// Location of the backing log relative to the task directory.
pub const LOG_PATH: &str = "logs/live_backing.log";

/// The log a task's author sees.
///
/// Worker messages are prefixed per line so they stand out from command
/// output, which is written to the same file unmodified.
#[derive(Debug)]
pub struct TaskLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl TaskLog {
    /// Create (or truncate) the backing log in `task_dir`.
    pub fn create(task_dir: &Path) -> std::io::Result<Self> {
        let path = task_dir.join(LOG_PATH);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        File::create(&path)?;
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn timestamp() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.prefixed(&format!("[worker {}] ", Self::timestamp()), message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.prefixed(
            &format!("[worker:warn {}] ", Self::timestamp()),
            message.as_ref(),
        );
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.prefixed("[worker:error] ", message.as_ref());
    }

    fn prefixed(&self, prefix: &str, message: &str) {
        let mut text = String::with_capacity(message.len() + prefix.len() + 1);
        for line in message.lines() {
            text.push_str(prefix);
            text.push_str(line);
            text.push('\n');
        }
        if text.is_empty() {
            text.push_str(prefix);
            text.push('\n');
        }
        self.write_raw(text.as_bytes());
    }

    /// Append bytes as they are.
    pub fn write_raw(&self, bytes: &[u8]) {
        let mut file = self.file.lock().expect("task log lock poisoned");
        if let Err(e) = file.write_all(bytes) {
            tracing::warn!(path = %self.path.display(), error = %e, "Cannot write task log");
        }
    }

    /// A handle child processes can write their output to directly.
    pub fn stdio(&self) -> std::io::Result<Stdio> {
        let file = self.file.lock().expect("task log lock poisoned");
        Ok(Stdio::from(file.try_clone()?))
    }

    pub fn contents(&self) -> std::io::Result<String> {
        std::fs::read_to_string(&self.path)
    }
}
