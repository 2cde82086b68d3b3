
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use fleet_worker::exit_code::ExitCode;
use fleet_worker::task::errors::Resolution;
use fleet_worker::task::log::LOG_ARTIFACT_NAME;
use fleet_worker::task::status::TaskUpdateReason;
use fleet_worker::worker::WorkerContext;

use test_harness::{
    journal, shell_payload, sleep_payload, ProvisionStep, RecordingFeature,
    ScriptedProvisioner, StartBehaviour, TestWorker,
};

async fn run_to_exit(mut worker: WorkerContext) -> ExitCode {
    assert_eq!(worker.init().await.unwrap(), None);
    let code = tokio::time::timeout(Duration::from_secs(60), worker.run())
        .await
        .expect("worker did not exit");
    worker.shutdown().await.unwrap();
    code
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tasks_run_concurrently_up_to_capacity() {
    let mut harness = TestWorker::new();
    harness.config.capacity = 2;
    harness.config.number_of_tasks_to_run = 2;
    let first = harness.schedule(sleep_payload(3));
    let second = harness.schedule(sleep_payload(3));

    let started = std::time::Instant::now();
    let code = run_to_exit(harness.context()).await;

    assert_eq!(code, ExitCode::TasksComplete);
    assert!(
        started.elapsed() <= Duration::from_millis(4500),
        "tasks ran sequentially: {:?}",
        started.elapsed()
    );
    assert_eq!(harness.queue.resolution(&first), Some(Resolution::Completed));
    assert_eq!(harness.queue.resolution(&second), Some(Resolution::Completed));

    let dirs: HashSet<_> = [&first, &second]
        .iter()
        .map(|task_id| {
            let log = harness
                .queue
                .artifacts(task_id)
                .into_iter()
                .find(|a| a.name == LOG_ARTIFACT_NAME)
                .unwrap();
            log.path.parent().unwrap().parent().unwrap().to_path_buf()
        })
        .collect();
    assert_eq!(dirs.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_without_tasks() {
    let mut harness = TestWorker::new();
    harness.config.idle_timeout_secs = 7;

    let started = tokio::time::Instant::now();
    let code = run_to_exit(harness.context()).await;

    assert_eq!(code, ExitCode::IdleTimeout);
    assert!(started.elapsed() >= Duration::from_secs(7));
}

#[tokio::test]
async fn test_task_limit_exits_tasks_complete() {
    let mut harness = TestWorker::new();
    harness.config.number_of_tasks_to_run = 1;
    harness.config.clean_up_task_dirs = false;
    let first = harness.schedule(shell_payload("echo from-the-task", 30));
    harness.schedule(shell_payload("true", 30));

    let code = run_to_exit(harness.context()).await;

    assert_eq!(code, ExitCode::TasksComplete);
    assert_eq!(harness.queue.resolution(&first), Some(Resolution::Completed));
    assert_eq!(harness.queue.pending_count(), 1);

    let log = harness
        .queue
        .artifacts(&first)
        .into_iter()
        .find(|a| a.name == LOG_ARTIFACT_NAME)
        .unwrap();
    let contents = std::fs::read_to_string(&log.path).unwrap();
    assert!(contents.contains("from-the-task"));
    assert!(contents.contains("[worker "));
    assert!(contents.contains("=== Task Finished: completed ==="));
}

#[tokio::test]
async fn test_resolved_counter_survives_restart() {
    let mut harness = TestWorker::new();
    harness.config.number_of_tasks_to_run = 1;
    harness.config.tasks_resolved_file = Some(harness.dir.path().join("tasks-resolved-count.txt"));
    harness.schedule(shell_payload("true", 30));
    harness.schedule(shell_payload("true", 30));

    assert_eq!(run_to_exit(harness.context()).await, ExitCode::TasksComplete);
    let saved = std::fs::read_to_string(harness.config.tasks_resolved_file.as_ref().unwrap())
        .unwrap();
    assert_eq!(saved.trim(), "1");

    let claims_before = harness.queue.claim_calls();
    assert_eq!(run_to_exit(harness.context()).await, ExitCode::TasksComplete);
    assert_eq!(harness.queue.claim_calls(), claims_before);
    assert_eq!(harness.queue.pending_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_request_resolves_worker_shutdown() {
    let harness = TestWorker::new();
    let task_id = harness.schedule(sleep_payload(30));
    let mut worker = harness.context();
    let termination = worker.termination();
    let task_manager = worker.task_manager();
    assert_eq!(worker.init().await.unwrap(), None);

    let handle = tokio::spawn(async move { worker.run().await });
    tokio::time::timeout(Duration::from_secs(10), async {
        while task_manager.task_count() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    termination.request(false);

    let code = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, ExitCode::WorkerShutdown);
    assert_eq!(
        harness.queue.resolution(&task_id),
        Some(Resolution::Exception(TaskUpdateReason::WorkerShutdown))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_finish_request_waits_for_running_task() {
    let harness = TestWorker::new();
    let task_id = harness.schedule(sleep_payload(1));
    let mut worker = harness.context();
    let termination = worker.termination();
    let task_manager = worker.task_manager();
    assert_eq!(worker.init().await.unwrap(), None);

    let handle = tokio::spawn(async move { worker.run().await });
    tokio::time::timeout(Duration::from_secs(10), async {
        while task_manager.task_count() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    termination.request(true);

    let code = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, ExitCode::WorkerShutdown);
    assert_eq!(harness.queue.resolution(&task_id), Some(Resolution::Completed));
}

#[tokio::test]
async fn test_interrupt_exits_worker_stopped() {
    let harness = TestWorker::new();
    let worker = harness.context();
    worker.interrupt_token().cancel();

    assert_eq!(run_to_exit(worker).await, ExitCode::WorkerStopped);
}

#[tokio::test]
async fn test_outdated_deployment_exits() {
    let mut harness = TestWorker::new();
    harness.config.check_for_new_deployment_every_secs = 0;
    harness.worker_manager.set(true);

    assert_eq!(
        run_to_exit(harness.context()).await,
        ExitCode::NonCurrentDeploymentId
    );
}

#[tokio::test]
async fn test_max_run_time_fails_task() {
    let mut harness = TestWorker::new();
    harness.config.number_of_tasks_to_run = 1;
    let task_id = harness.schedule(json!({
        "command": [["sleep", "30"]],
        "maxRunTime": 1,
    }));

    let started = std::time::Instant::now();
    assert_eq!(run_to_exit(harness.context()).await, ExitCode::TasksComplete);

    assert_eq!(harness.queue.resolution(&task_id), Some(Resolution::Failed));
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[tokio::test]
async fn test_retry_exit_code_is_intermittent() {
    let mut harness = TestWorker::new();
    harness.config.number_of_tasks_to_run = 2;
    let retried = harness.schedule(json!({
        "command": [["sh", "-c", "exit 5"]],
        "maxRunTime": 30,
        "onExitStatus": {"retry": [5]},
    }));
    let failed = harness.schedule(json!({
        "command": [["sh", "-c", "exit 6"]],
        "maxRunTime": 30,
        "onExitStatus": {"retry": [5]},
    }));

    assert_eq!(run_to_exit(harness.context()).await, ExitCode::TasksComplete);

    assert_eq!(
        harness.queue.resolution(&retried),
        Some(Resolution::Exception(TaskUpdateReason::IntermittentTask))
    );
    assert_eq!(harness.queue.resolution(&failed), Some(Resolution::Failed));
}

#[tokio::test]
async fn test_malformed_payload_is_reported() {
    let mut harness = TestWorker::new();
    harness.config.number_of_tasks_to_run = 1;
    let task_id = harness.schedule(json!({"command": [], "maxRunTime": 30}));

    assert_eq!(run_to_exit(harness.context()).await, ExitCode::TasksComplete);
    assert_eq!(
        harness.queue.resolution(&task_id),
        Some(Resolution::Exception(TaskUpdateReason::MalformedPayload))
    );
}

#[tokio::test]
async fn test_panicking_feature_exits_internal_error() {
    let harness = TestWorker::new();
    let task_id = harness.schedule(shell_payload("true", 30));
    let calls = journal();
    let worker = harness.context().with_features(vec![RecordingFeature::new("X", &calls)
        .behaving(StartBehaviour::Panic)
        .boxed()]);

    assert_eq!(run_to_exit(worker).await, ExitCode::InternalError);
    assert_eq!(
        harness.queue.resolution(&task_id),
        Some(Resolution::Exception(TaskUpdateReason::InternalError))
    );
}

#[tokio::test]
async fn test_failed_replacement_environment_exits_internal_error() {
    let harness = TestWorker::new();
    let first = harness.schedule(shell_payload("true", 30));
    harness.schedule(shell_payload("true", 30));
    let provisioner = Arc::new(ScriptedProvisioner::new(
        &harness.config.tasks_dir,
        vec![ProvisionStep::Ready, ProvisionStep::Fail],
    ));

    let code = run_to_exit(harness.context_with(provisioner.clone())).await;

    assert_eq!(code, ExitCode::InternalError);
    assert_eq!(harness.queue.resolution(&first), Some(Resolution::Completed));
    assert_eq!(harness.queue.pending_count(), 1);
    assert_eq!(provisioner.calls(), 2);
}

#[tokio::test]
async fn test_reboot_after_task_exits_reboot_required() {
    let harness = TestWorker::new();
    let task_id = harness.schedule(shell_payload("true", 30));
    let provisioner = Arc::new(ScriptedProvisioner::new(
        &harness.config.tasks_dir,
        vec![ProvisionStep::Ready, ProvisionStep::RebootRequired],
    ));
    let mut worker = harness.context_with(provisioner);
    let pool = worker.pool();

    assert_eq!(worker.init().await.unwrap(), None);
    let code = tokio::time::timeout(Duration::from_secs(60), worker.run())
        .await
        .expect("worker did not exit");

    assert_eq!(code, ExitCode::RebootRequired);
    assert_eq!(harness.queue.resolution(&task_id), Some(Resolution::Completed));
    assert_eq!(pool.ready_count(), 0);
    assert_eq!(worker.tasks_resolved(), 1);
}

#[tokio::test]
async fn test_slow_artifact_upload_does_not_hit_max_run_time() {
    let mut harness = TestWorker::new();
    harness.config.number_of_tasks_to_run = 1;
    harness.queue.set_upload_delay(Duration::from_millis(1500));
    let task_id = harness.schedule(json!({
        "command": [["sh", "-c", "echo done > out.txt"]],
        "maxRunTime": 1,
        "artifacts": [{"type": "file", "path": "out.txt", "name": "public/out.txt"}],
    }));

    assert_eq!(run_to_exit(harness.context()).await, ExitCode::TasksComplete);

    assert_eq!(harness.queue.resolution(&task_id), Some(Resolution::Completed));
    assert!(harness
        .queue
        .artifacts(&task_id)
        .iter()
        .any(|a| a.name == "public/out.txt"));
}

#[tokio::test]
async fn test_invalid_config_fails_init() {
    let mut harness = TestWorker::new();
    harness.config.worker_type = String::new();
    let mut worker = harness.context();

    assert!(worker.init().await.is_err());
}
