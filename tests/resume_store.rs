// tests/resume_store.rs

use std::sync::Arc;

use drmflow::config::{WorkflowFile, declare_stages, workflow_settings};
use drmflow::engine::Runner;
use drmflow::store::{JsonFileStore, MemoryStore, WorkflowStore};
use drmflow::types::{PatternKind, TaskStatus, WorkflowStatus, tags};
use drmflow_test_utils::{
    FakeDrm, StageConfigBuilder, WorkflowFileBuilder, fast_options, init_tracing, registry_with,
    with_timeout,
};

fn pipeline(log_dir: &std::path::Path) -> WorkflowFile {
    WorkflowFileBuilder::new("pipeline")
        .log_dir(log_dir)
        .stage(
            StageConfigBuilder::new("align")
                .cmd("align {s}")
                .task(tags([("s", "a")]))
                .task(tags([("s", "b")]))
                .build(),
        )
        .stage(
            StageConfigBuilder::new("call")
                .parent("align")
                .cmd("call {s}")
                .build(),
        )
        .stage(
            StageConfigBuilder::new("report")
                .parent("call")
                .pattern(PatternKind::ManyToOne)
                .cmd("report")
                .build(),
        )
        .build()
}

/// Open (resume or restart), declare and run once against `drm`.
async fn run_once(
    store: Arc<dyn WorkflowStore>,
    file: &WorkflowFile,
    drm: &FakeDrm,
    restart: bool,
) -> (bool, drmflow::model::Workflow) {
    let mut wf = store
        .start(&file.workflow.name, workflow_settings(file), restart)
        .unwrap();
    declare_stages(&mut wf, file).unwrap();
    let runner = Runner::new(registry_with(drm), fast_options()).with_store(store);
    let ok = with_timeout(runner.run(&mut wf)).await.unwrap();
    (ok, wf)
}

#[tokio::test]
async fn resuming_a_finished_workflow_submits_nothing() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn WorkflowStore> = Arc::new(JsonFileStore::new(dir.path().join("db")));
    let file = pipeline(&dir.path().join("log"));

    let first = FakeDrm::new();
    let (ok, _) = run_once(store.clone(), &file, &first, false).await;
    assert!(ok);
    assert_eq!(first.submission_count(), 5);

    let second = FakeDrm::new();
    let (ok, wf) = run_once(store.clone(), &file, &second, false).await;
    assert!(ok);
    assert_eq!(second.submission_count(), 0);
    assert_eq!(wf.status, WorkflowStatus::Successful);
    assert_eq!(wf.tasks().count(), 5);
}

#[tokio::test]
async fn resume_reruns_only_unfinished_work() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn WorkflowStore> = Arc::new(JsonFileStore::new(dir.path().join("db")));
    let file = pipeline(&dir.path().join("log"));

    let first = FakeDrm::new();
    first.exit_with("call/s=b", 1);
    let (ok, wf) = run_once(store.clone(), &file, &first, false).await;
    assert!(!ok);
    assert_eq!(wf.status, WorkflowStatus::Failed);
    assert_eq!(wf.task_by_uid("call", "s=a").unwrap().status, TaskStatus::Successful);

    let persisted = store.load("pipeline").unwrap().unwrap();
    assert_eq!(persisted.status, WorkflowStatus::Failed);

    let second = FakeDrm::new();
    let (ok, wf) = run_once(store.clone(), &file, &second, false).await;
    assert!(ok);
    let rerun: Vec<String> = second
        .submissions()
        .into_iter()
        .map(|s| format!("{}/{}", s.stage, s.uid))
        .collect();
    assert_eq!(rerun, ["call/s=b", "report/default"]);
    assert_eq!(wf.tasks().count(), 5);
}

#[tokio::test]
async fn restart_runs_everything_again() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
    let file = pipeline(dir.path());

    let first = FakeDrm::new();
    assert!(run_once(store.clone(), &file, &first, false).await.0);

    let second = FakeDrm::new();
    let (ok, _) = run_once(store.clone(), &file, &second, true).await;
    assert!(ok);
    assert_eq!(second.submission_count(), 5);
}
