// tests/config_loading.rs

use std::fs;
use std::path::{Path, PathBuf};

use drmflow::cli::RunArgs;
use drmflow::config::{declare_stages, load_and_validate, workflow_settings};
use drmflow::errors::FlowError;
use drmflow::model::Workflow;
use drmflow::store::{JsonFileStore, WorkflowStore};
use drmflow::types::{PatternKind, WorkflowStatus};
use drmflow_test_utils::{init_tracing, with_timeout};

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("Drmflow.toml");
    fs::write(&path, body).unwrap();
    path
}

fn toml_path(p: &Path) -> String {
    p.display().to_string().replace('\\', "/")
}

fn pipeline_toml(log_dir: &Path) -> String {
    format!(
        r#"
[workflow]
name = "greet"
max_cores = 2
log_dir = "{log}"
poll_interval_ms = 10

[[stage]]
name = "report"
parents = ["hello"]
pattern = "many_to_one"
cmd = "echo done"

[[stage]]
name = "hello"
cmd = "echo hello {{who}}"
tasks = [{{ who = "alice" }}, {{ who = "bob" }}]
"#,
        log = toml_path(log_dir)
    )
}

fn run_args(config: PathBuf, store: PathBuf, dry_run: bool) -> RunArgs {
    RunArgs {
        config,
        restart: false,
        dry_run,
        store,
    }
}

#[test]
fn stages_are_reordered_parents_first() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), &pipeline_toml(&dir.path().join("log")));

    let file = load_and_validate(&path).unwrap();
    let names: Vec<&str> = file.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["hello", "report"]);
    assert_eq!(file.workflow.max_cores, Some(2));
    assert_eq!(
        file.stage("report").unwrap().effective_pattern(),
        Some(PatternKind::ManyToOne)
    );

    let mut wf = Workflow::new("greet", workflow_settings(&file));
    declare_stages(&mut wf, &file).unwrap();
    assert_eq!(wf.tasks().count(), 3);
    assert_eq!(
        wf.task_by_uid("hello", "who=bob").unwrap().command.as_deref(),
        Some("echo hello bob")
    );
}

#[test]
fn unknown_keys_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
[workflow]
name = "w"
max_cores = 2
colour = "blue"

[[stage]]
name = "a"
cmd = "true"
"#,
    );
    let err = load_and_validate(&path).unwrap_err();
    assert!(matches!(err, FlowError::TomlError(_)), "got {err:?}");
}

#[test]
fn cyclic_stages_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
[workflow]
name = "w"

[[stage]]
name = "a"
parents = ["b"]
cmd = "true"

[[stage]]
name = "b"
parents = ["a"]
cmd = "true"
"#,
    );
    let err = load_and_validate(&path).unwrap_err();
    assert!(matches!(err, FlowError::DagCycle(_)), "got {err:?}");
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_and_validate(dir.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, FlowError::IoError(_)), "got {err:?}");
}

#[tokio::test]
async fn dry_run_leaves_the_store_untouched() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("log");
    let path = write_config(dir.path(), &pipeline_toml(&log_dir));
    let store = dir.path().join("db");

    let ok = drmflow::run_workflow(run_args(path, store.clone(), true))
        .await
        .unwrap();
    assert!(ok);
    assert!(JsonFileStore::new(&store).load("greet").unwrap().is_none());
    assert!(!log_dir.exists());
}

#[cfg(unix)]
#[tokio::test]
async fn local_backend_runs_the_workflow_end_to_end() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("log");
    let path = write_config(dir.path(), &pipeline_toml(&log_dir));
    let store = dir.path().join("db");

    let ok = with_timeout(drmflow::run_workflow(run_args(path.clone(), store.clone(), false)))
        .await
        .unwrap();
    assert!(ok);

    let stdout = fs::read_to_string(log_dir.join("hello/who=alice/stdout_attempt1.txt")).unwrap();
    assert_eq!(stdout.trim(), "hello alice");
    assert!(log_dir.join("report/default/command_attempt1.sh").exists());

    let wf = JsonFileStore::new(&store).load("greet").unwrap().unwrap();
    assert_eq!(wf.status, WorkflowStatus::Successful);
    let report = wf.task_by_uid("report", "default").unwrap();
    assert_eq!(report.usage.as_ref().and_then(|u| u.exit_status), Some(0));

    // A second invocation resumes and has nothing left to do.
    let ok = with_timeout(drmflow::run_workflow(run_args(path, store, false)))
        .await
        .unwrap();
    assert!(ok);
}

#[cfg(unix)]
#[tokio::test]
async fn failing_local_command_fails_the_workflow() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("log");
    let path = write_config(
        dir.path(),
        &format!(
            r#"
[workflow]
name = "broken"
log_dir = "{}"
poll_interval_ms = 10

[[stage]]
name = "boom"
cmd = "echo nope >&2; exit 3"
"#,
            toml_path(&log_dir)
        ),
    );
    let store = dir.path().join("db");

    let ok = with_timeout(drmflow::run_workflow(run_args(path, store.clone(), false)))
        .await
        .unwrap();
    assert!(!ok);

    let wf = JsonFileStore::new(&store).load("broken").unwrap().unwrap();
    assert_eq!(wf.status, WorkflowStatus::Failed);
    let task = wf.task_by_uid("boom", "default").unwrap();
    assert_eq!(task.usage.as_ref().and_then(|u| u.exit_status), Some(3));
    let stderr = fs::read_to_string(log_dir.join("boom/default/stderr_attempt1.txt")).unwrap();
    assert_eq!(stderr.trim(), "nope");
}
