// src/lib.rs

pub mod cli;
pub mod config;
pub mod drm;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod logging;
pub mod model;
pub mod state;
pub mod store;
pub mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cli::{CliArgs, Command, RunArgs, StatusArgs};
use crate::config::{
    WorkflowFile, build_registry, declare_stages, load_and_validate, run_options, workflow_settings,
};
use crate::engine::{Runner, spawn_ctrl_c};
use crate::model::Workflow;
use crate::store::{JsonFileStore, MemoryStore, WorkflowStore};
use crate::types::TaskStatus;

/// High-level entry point used by `main.rs`.
///
/// Returns whether the command succeeded; the binary maps this to the
/// process exit code.
pub async fn run(args: CliArgs) -> Result<bool> {
    match args.command {
        Command::Run(run_args) => run_workflow(run_args).await,
        Command::Status(status_args) => {
            print_status(&status_args)?;
            Ok(true)
        }
    }
}

/// Load, expand and run one workflow file.
///
/// - loads and validates the TOML
/// - resumes (or restarts) the persisted graph in the store
/// - declares every stage, expanding patterns
/// - runs until the queue drains, Ctrl-C, or a fault
pub async fn run_workflow(args: RunArgs) -> Result<bool> {
    let file = load_and_validate(&args.config)
        .with_context(|| format!("loading workflow file {}", args.config.display()))?;
    let name = file.workflow.name.clone();
    let json_store = JsonFileStore::new(&args.store);

    if args.dry_run {
        let wf = preview(&json_store, &file, args.restart)?;
        print_dry_run(&wf);
        return Ok(true);
    }

    let store: Arc<dyn WorkflowStore> = Arc::new(json_store);
    let mut wf = store.start(&name, workflow_settings(&file), args.restart)?;
    declare_stages(&mut wf, &file).with_context(|| format!("expanding workflow '{name}'"))?;
    store.save(&wf)?;

    let registry = build_registry(&file)?;
    let runner = Runner::new(registry, run_options(&file)).with_store(store);
    let ctrl_c = spawn_ctrl_c(runner.terminator());

    info!(workflow = %name, store = %args.store.display(), "running workflow");
    let result = runner.run(&mut wf).await;
    ctrl_c.abort();
    Ok(result?)
}

/// Expand against a throwaway copy of the persisted graph.
fn preview(json_store: &JsonFileStore, file: &WorkflowFile, restart: bool) -> Result<Workflow> {
    let name = &file.workflow.name;
    let scratch = MemoryStore::new();
    if !restart {
        if let Some(existing) = json_store.load(name)? {
            scratch.save(&existing)?;
        }
    }
    let mut wf = scratch.start(name, workflow_settings(file), restart)?;
    declare_stages(&mut wf, file)?;
    Ok(wf)
}

/// Simple dry-run output: stages in run order with their tasks.
fn print_dry_run(wf: &Workflow) {
    println!("drmflow dry-run: workflow '{}'", wf.name);
    if let Some(max) = wf.settings.max_cores {
        println!("  max_cores = {max}");
    }
    println!("  max_attempts = {}", wf.settings.max_attempts);
    println!("  log_dir = {}", wf.settings.log_dir.display());
    println!();

    let mut stages: Vec<_> = wf.stages().collect();
    stages.sort_by_key(|s| s.number);
    for stage in stages {
        let tasks = wf.stage_tasks(stage.id);
        println!("stage {} ({} tasks, {})", stage.name, tasks.len(), stage.status);
        for task in tasks {
            match &task.command {
                Some(cmd) => println!(
                    "  - {} [{}] cores={} drm={}: {}",
                    task.uid, task.status, task.resources.cores, task.drm, cmd
                ),
                None => println!("  - {} [{}] no-op", task.uid, task.status),
            }
        }
    }

    debug!("dry-run complete (nothing submitted)");
}

fn print_status(args: &StatusArgs) -> Result<()> {
    let store = JsonFileStore::new(&args.store);
    let wf = store
        .load(&args.name)?
        .with_context(|| format!("no workflow named '{}' in {}", args.name, args.store.display()))?;

    println!("workflow {}: {}", wf.name, wf.status);
    let mut stages: Vec<_> = wf.stages().collect();
    stages.sort_by_key(|s| s.number);
    for stage in stages {
        let tasks = wf.stage_tasks(stage.id);
        let done = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Successful)
            .count();
        println!("  {:<24} {:<20} {done}/{} successful", stage.name, stage.status.as_str(), tasks.len());
    }
    Ok(())
}
