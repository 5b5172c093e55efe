//! End-to-end task lifecycle through the manager surface: submission,
//! execution, status reporting, cancellation, retention, and the audit trail.

use std::sync::Arc;

use conveyor_config::{AdmissionPolicy, Settings};
use conveyor_core::{Error, JobParams, JobType, TaskState};
use conveyor_manager::{tail_log, TaskManager};
use conveyor_pipeline::checksum_file;
use conveyor_workspace::{read_status, status_path, Workspace};

fn test_settings(dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.tasks_root = dir.join("tasks");
    settings.audit.path = dir.join("audit.log");
    settings.sandbox.restrict_filesystem = false;
    settings.sandbox.restrict_network = false;
    settings.sandbox.cpu_secs = None;
    settings.sandbox.memory_bytes = None;
    settings
}

fn convert_params(text: &str, name: &str) -> JobParams {
    let mut params = JobParams::new();
    params.insert("text", text);
    params.insert("name", name);
    params
}

#[tokio::test]
async fn convert_job_runs_to_completion_with_checksummed_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::new(test_settings(dir.path())).unwrap();

    let id = manager
        .submit(JobType::Convert, convert_params("hello pipeline", "greeting"))
        .await
        .unwrap();
    let view = manager.wait(id).await.unwrap();

    assert_eq!(view.state, TaskState::Completed);
    assert!(view.started_at.is_some() && view.finished_at.is_some());
    assert_eq!(view.artifacts.len(), 1);

    let artifact = &view.artifacts[0];
    assert_eq!(artifact.name, "greeting.txt");
    let content = std::fs::read_to_string(&artifact.path).unwrap();
    assert_eq!(content, "HELLO PIPELINE");
    assert_eq!(checksum_file(&artifact.path).unwrap(), artifact.checksum);

    // The durable status file agrees with the in-memory view
    let workspace = Workspace::at(artifact.path.parent().unwrap().parent().unwrap().into());
    let status = read_status(&status_path(&workspace)).unwrap();
    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.checksums.get("greeting.txt"), Some(&artifact.checksum));
    assert!(status.error.is_none());
}

#[tokio::test]
async fn status_reports_every_step_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::new(test_settings(dir.path())).unwrap();

    let id = manager
        .submit(JobType::Convert, convert_params("abc", "out"))
        .await
        .unwrap();
    let view = manager.wait(id).await.unwrap();

    let names: Vec<_> = view.steps.iter().map(|s| s.step.as_str()).collect();
    assert_eq!(names, ["ingest", "transform", "package"]);
    assert!(view.steps.iter().all(|s| s.succeeded()));
}

#[tokio::test]
async fn submission_at_capacity_is_rejected_without_a_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.max_concurrent_tasks = 1;
    settings.admission = AdmissionPolicy::Reject;
    let manager = TaskManager::new(settings).unwrap();

    let first = manager
        .submit(JobType::Convert, convert_params("busy", "first"))
        .await
        .unwrap();
    let err = manager
        .submit(JobType::Convert, convert_params("late", "second"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Capacity { .. }));

    manager.wait(first).await.unwrap();

    // Only the admitted task left a workspace behind
    let partitions: Vec<_> = std::fs::read_dir(dir.path().join("tasks"))
        .unwrap()
        .collect::<std::io::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(partitions.len(), 1);
    let tasks: Vec<_> = std::fs::read_dir(partitions[0].path())
        .unwrap()
        .collect::<std::io::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(tasks.len(), 1);
}

#[tokio::test]
async fn queued_submission_runs_after_the_slot_frees() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.max_concurrent_tasks = 1;
    settings.admission = AdmissionPolicy::Queue { depth: 2 };
    let manager = Arc::new(TaskManager::new(settings).unwrap());

    let first = manager
        .submit(JobType::Convert, convert_params("one", "one"))
        .await
        .unwrap();
    let queued = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .submit(JobType::Convert, convert_params("two", "two"))
                .await
        })
    };

    assert_eq!(manager.wait(first).await.unwrap().state, TaskState::Completed);
    let second = queued.await.unwrap().unwrap();
    assert_eq!(manager.wait(second).await.unwrap().state, TaskState::Completed);
}

#[tokio::test]
async fn cancelled_task_ends_cancelled_and_keeps_its_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::new(test_settings(dir.path())).unwrap();

    let id = manager
        .submit(JobType::Bundle, {
            let mut p = JobParams::new();
            p.insert("label", "release-1");
            p
        })
        .await
        .unwrap();
    let cancel_result = manager.cancel(id).await;
    let view = manager.wait(id).await.unwrap();

    match cancel_result {
        Ok(()) => {
            // Cancellation landed before the pipeline finished
            assert_eq!(view.state, TaskState::Cancelled);

            // The workspace survives for inspection until retention removes it
            assert!(dir.path().join("tasks").exists());

            // Cancelling again is an error once terminal
            let err = manager.cancel(id).await.unwrap_err();
            assert!(matches!(err, Error::Validation { .. }));

            let lines = tail_log(&dir.path().join("audit.log"), 100).unwrap();
            assert!(lines.iter().any(|l| l.contains("\"event\":\"cancel_requested\"")));
            assert!(lines.iter().any(|l| {
                l.contains("\"event\":\"task_finalized\"") && l.contains("\"state\":\"cancelled\"")
            }));
        }
        Err(Error::Validation { .. }) => {
            // The three-step pipeline beat the cancel to a terminal state;
            // cancelling a finished task is the validation error
            assert_eq!(view.state, TaskState::Completed);
        }
        Err(other) => panic!("unexpected cancel error: {other}"),
    }
}

#[tokio::test]
async fn audit_log_carries_the_full_lifecycle_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::new(test_settings(dir.path())).unwrap();

    let id = manager
        .submit(JobType::Convert, convert_params("audit me", "audited"))
        .await
        .unwrap();
    manager.wait(id).await.unwrap();

    let lines = tail_log(&dir.path().join("audit.log"), 100).unwrap();
    let kinds: Vec<String> = lines
        .iter()
        .map(|l| {
            serde_json::from_str::<serde_json::Value>(l).unwrap()["event"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(kinds.first().map(String::as_str), Some("task_submitted"));
    assert_eq!(kinds.get(1).map(String::as_str), Some("task_started"));
    assert_eq!(kinds.last().map(String::as_str), Some("task_finalized"));
    assert!(kinds.iter().filter(|k| *k == "step_finished").count() >= 3);
}

#[tokio::test]
async fn sweeper_pass_is_idempotent_and_audited_once() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::new(test_settings(dir.path())).unwrap();

    let id = manager
        .submit(JobType::Convert, convert_params("expire me", "old"))
        .await
        .unwrap();
    manager.wait(id).await.unwrap();

    let future = chrono::Utc::now() + chrono::Days::new(30);
    let first = manager.sweep(future).await.unwrap();
    assert_eq!(first.removed.len(), 1);

    let second = manager.sweep(future).await.unwrap();
    assert!(second.removed.is_empty());

    let lines = tail_log(&dir.path().join("audit.log"), 100).unwrap();
    let removals = lines
        .iter()
        .filter(|l| l.contains("\"event\":\"workspace_removed\""))
        .count();
    assert_eq!(removals, 1);
}
