use std::collections::HashSet;
use std::sync::Arc;

use fleet_worker::environment::{CurrentUserProvisioner, TaskEnvironmentPool};
use fleet_worker::worker::gc;
use tempfile::TempDir;

fn pool(dir: &TempDir, size: usize) -> TaskEnvironmentPool {
    TaskEnvironmentPool::new(Arc::new(CurrentUserProvisioner::new(dir.path())), size)
}

#[tokio::test]
async fn test_pool_hands_out_exactly_size_environments() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir, 3);
    assert!(!pool.initialize().await.unwrap());

    let mut envs = Vec::new();
    for _ in 0..3 {
        envs.push(pool.acquire().unwrap());
    }
    assert!(pool.acquire().is_none());

    let dirs: HashSet<_> = envs.iter().map(|env| env.task_dir.clone()).collect();
    assert_eq!(dirs.len(), 3);
    for env in &envs {
        assert!(env.task_dir.is_dir());
        assert!(env.log_dir().is_dir());
        assert!(env.task_dir_name().starts_with("task_"));
    }
}

#[tokio::test]
async fn test_release_replaces_with_fresh_environment() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir, 2);
    pool.initialize().await.unwrap();

    let first = pool.acquire().unwrap();
    let second = pool.acquire().unwrap();
    assert!(!pool.release(&first).await.unwrap());
    assert!(!pool.release(&second).await.unwrap());

    assert_eq!(pool.ready_count(), 2);
    assert_eq!(pool.in_use_count(), 0);
    let names = pool.active_task_dir_names();
    assert!(!names.contains(&first.task_dir_name()));
    assert!(!names.contains(&second.task_dir_name()));
}

#[tokio::test]
async fn test_double_release_fails() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir, 1);
    pool.initialize().await.unwrap();

    let env = pool.acquire().unwrap();
    pool.release(&env).await.unwrap();
    assert!(pool.release(&env).await.is_err());
    assert_eq!(pool.ready_count(), 1);
}

#[tokio::test]
async fn test_purge_removes_only_retired_directories() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir, 2);
    pool.initialize().await.unwrap();

    let retired = pool.acquire().unwrap();
    let in_use = pool.acquire().unwrap();
    pool.release(&retired).await.unwrap();
    std::fs::create_dir(dir.path().join("unrelated")).unwrap();

    gc::purge(dir.path(), &pool, None).await.unwrap();

    assert!(!retired.task_dir.exists());
    assert!(in_use.task_dir.exists());
    assert!(dir.path().join("unrelated").exists());
    for name in pool.active_task_dir_names() {
        assert!(dir.path().join(name).exists());
    }
}
