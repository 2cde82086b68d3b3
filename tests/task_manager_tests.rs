use std::sync::Arc;
use std::time::Duration;

use fleet_worker::task::manager::{RunningTask, TaskManager};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_add_and_remove_ends_idle() {
    let manager = Arc::new(TaskManager::new(100));
    let mut handles = Vec::new();

    for i in 0..50 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            let task_id = format!("task-{}", i);
            manager
                .add_task(RunningTask::new(&task_id, 0, format!("task_{}", i)))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(manager.remove_task(&task_id).is_some());
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(manager.task_count(), 0);
    assert!(manager.is_idle());
    assert_eq!(manager.available_capacity(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_holds_under_contention() {
    let manager = Arc::new(TaskManager::new(10));
    let mut handles = Vec::new();

    for i in 0..50 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager
                .add_task(RunningTask::new(format!("task-{}", i), 0, format!("task_{}", i)))
                .is_ok()
        }));
    }
    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 10);
    assert_eq!(manager.task_count(), 10);
    assert_eq!(manager.available_capacity(), 0);
}

#[tokio::test]
async fn test_wait_for_all_wakes_on_last_removal() {
    let manager = Arc::new(TaskManager::new(2));
    manager.add_task(RunningTask::new("a", 0, "task_a")).unwrap();
    manager.add_task(RunningTask::new("b", 0, "task_b")).unwrap();

    let remover = Arc::clone(&manager);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        remover.remove_task("a");
        tokio::time::sleep(Duration::from_millis(50)).await;
        remover.remove_task("b");
    });

    tokio::time::timeout(Duration::from_secs(5), manager.wait_for_all())
        .await
        .unwrap();
    assert!(manager.is_idle());
}

#[tokio::test]
async fn test_running_task_dir_names() {
    let manager = TaskManager::new(2);
    manager.add_task(RunningTask::new("a", 0, "task_1")).unwrap();
    manager.add_task(RunningTask::new("b", 1, "task_2")).unwrap();

    let mut names = manager.running_task_dir_names();
    names.sort();
    assert_eq!(names, vec!["task_1", "task_2"]);
}
