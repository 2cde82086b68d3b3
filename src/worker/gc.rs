use std::path::Path;

use nix::sys::statvfs::statvfs;

use crate::environment::{TaskEnvironmentPool, UserAccounts, TASK_PREFIX};
use crate::error::Result;

const MEGABYTE: u64 = 1024 * 1024;

/// Delete `task_*` directories under `tasks_dir` except those in `keep`.
/// Returns the names removed.
pub async fn purge_task_dirs(tasks_dir: &Path, keep: &[String]) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    let mut entries = match tokio::fs::read_dir(tasks_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(TASK_PREFIX) || keep.contains(&name) {
            continue;
        }
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        match tokio::fs::remove_dir_all(entry.path()).await {
            Ok(()) => {
                tracing::info!(dir = %name, "Removed stale task directory");
                removed.push(name);
            }
            Err(e) => tracing::warn!(dir = %name, error = %e, "Cannot remove stale task directory"),
        }
    }
    Ok(removed)
}

/// Delete `task_*` OS users except those in `keep`.
pub async fn purge_task_users(accounts: &dyn UserAccounts, keep: &[String]) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for name in accounts.list_users().await? {
        if !name.starts_with(TASK_PREFIX) || keep.contains(&name) {
            continue;
        }
        match accounts.delete_user(&name).await {
            Ok(()) => removed.push(name),
            Err(e) => tracing::warn!(user = %name, error = %e, "Cannot remove stale task user"),
        }
    }
    Ok(removed)
}

/// Remove task directories and users the pool no longer holds.
pub async fn purge(
    tasks_dir: &Path,
    pool: &TaskEnvironmentPool,
    accounts: Option<&dyn UserAccounts>,
) -> Result<()> {
    let snapshot = pool.purge_snapshot().await;
    purge_task_dirs(tasks_dir, &snapshot.task_dir_names).await?;
    if let Some(accounts) = accounts {
        if let Err(e) = purge_task_users(accounts, &snapshot.user_names).await {
            tracing::warn!(error = %e, "Cannot list task users to purge");
        }
    }
    Ok(())
}

/// Free space in megabytes on the filesystem holding `dir`.
pub fn free_disk_space_megabytes(dir: &Path) -> Result<u64> {
    let stats = statvfs(dir).map_err(std::io::Error::from)?;
    let available = u64::from(stats.blocks_available()) * u64::from(stats.fragment_size());
    Ok(available / MEGABYTE)
}

/// True if `dir` has at least `required` megabytes free.
pub fn sufficient_disk_space(dir: &Path, required: u64) -> Result<bool> {
    if required == 0 {
        return Ok(true);
    }
    let free = free_disk_space_megabytes(dir)?;
    if free < required {
        tracing::warn!(
            dir = %dir.display(),
            free_megabytes = free,
            required_megabytes = required,
            "Not enough free disk space to claim a task"
        );
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn purge_keeps_active_and_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["task_1", "task_2", "cache"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("task_file"), "x").unwrap();

        let removed = purge_task_dirs(dir.path(), &["task_2".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, vec!["task_1".to_string()]);
        assert!(dir.path().join("task_2").exists());
        assert!(dir.path().join("cache").exists());
        assert!(dir.path().join("task_file").exists());
    }

    #[tokio::test]
    async fn purge_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let removed = purge_task_dirs(&dir.path().join("absent"), &[]).await.unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn disk_space_check() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sufficient_disk_space(dir.path(), 0).unwrap());
        assert!(sufficient_disk_space(dir.path(), 1).unwrap());
        assert!(!sufficient_disk_space(dir.path(), u64::MAX / MEGABYTE).unwrap());
    }
}
