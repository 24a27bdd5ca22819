// src/engine/runner.rs

//! Async IO shell around [`SchedulerCore`].
//!
//! The runner owns the single control loop for one workflow. It performs
//! the IO the core cannot: writing task scripts, talking to DRM adapters,
//! sleeping between polls, reacting to termination and checkpointing the
//! graph to a store. Every status decision goes through the core and the
//! state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::drm::profile::merge_profile;
use crate::drm::script::materialize;
use crate::drm::usage::ResourceUsage;
use crate::drm::{DrmRegistry, SubmittedJob, TaskSubmission};
use crate::engine::core::{Outcome, SchedulerCore};
use crate::engine::report::FailureReport;
use crate::engine::terminate::{
    TerminationListener, TerminationReason, Terminator, termination_channel,
};
use crate::errors::{FlowError, Result};
use crate::model::{TaskId, Workflow};
use crate::state::{apply_stage_status, apply_task_status};
use crate::store::WorkflowStore;
use crate::types::{StageStatus, TaskStatus, WorkflowStatus};

/// Loop tuning for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Bounded sleep when an iteration saw no completions.
    pub poll_interval: Duration,
    /// Mark the workflow successful when the queue drains cleanly. Turn off
    /// to extend the same workflow across several runs.
    pub set_successful: bool,
    /// Consecutive polling rounds with a transport error before the run is
    /// aborted.
    pub transport_fault_limit: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            set_successful: true,
            transport_fault_limit: 5,
        }
    }
}

impl RunOptions {
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn set_successful(mut self, val: bool) -> Self {
        self.set_successful = val;
        self
    }

    pub fn transport_fault_limit(mut self, limit: u32) -> Self {
        self.transport_fault_limit = limit.max(1);
        self
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    drm: String,
    job: SubmittedJob,
}

/// Mutable state of a run in progress.
#[derive(Debug)]
struct RunState {
    core: SchedulerCore,
    in_flight: BTreeMap<TaskId, InFlight>,
    /// Tasks that failed for good, in the order they failed.
    failed: Vec<TaskId>,
    transport_faults: u32,
}

impl RunState {
    fn new(core: SchedulerCore) -> Self {
        Self {
            core,
            in_flight: BTreeMap::new(),
            failed: Vec::new(),
            transport_faults: 0,
        }
    }

    fn jobs_by_drm(&self) -> BTreeMap<String, Vec<SubmittedJob>> {
        let mut out: BTreeMap<String, Vec<SubmittedJob>> = BTreeMap::new();
        for entry in self.in_flight.values() {
            out.entry(entry.drm.clone()).or_default().push(entry.job.clone());
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Drained,
    Terminated(TerminationReason),
}

/// Drives one workflow to completion against a set of DRM backends.
pub struct Runner {
    registry: DrmRegistry,
    options: RunOptions,
    store: Option<Arc<dyn WorkflowStore>>,
    terminator: Terminator,
    listener: TerminationListener,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .field("store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl Runner {
    pub fn new(registry: DrmRegistry, options: RunOptions) -> Self {
        let (terminator, listener) = termination_channel();
        Self {
            registry,
            options,
            store: None,
            terminator,
            listener,
        }
    }

    /// Checkpoint the graph to `store` after every round with completions
    /// and once at the end of the run.
    pub fn with_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Listen on an existing termination channel instead of a private one.
    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.listener = terminator.listener();
        self.terminator = terminator;
        self
    }

    /// Handle for requesting termination of this runner's runs.
    pub fn terminator(&self) -> Terminator {
        self.terminator.clone()
    }

    /// Run `wf` until its queue drains or termination is requested.
    ///
    /// Returns `Ok(true)` on success and `Ok(false)` when the workflow
    /// failed or was terminated by the operator. Configuration problems
    /// found before the loop starts are returned as errors without touching
    /// the workflow status; faults during the loop terminate the run and are
    /// returned after shutdown.
    pub async fn run(&self, wf: &mut Workflow) -> Result<bool> {
        self.terminator.clear_fault();
        let core = self.preflight(wf)?;

        let now = Utc::now();
        wf.status = WorkflowStatus::Running;
        wf.started_on = Some(now);
        wf.finished_on = None;
        info!(
            workflow = %wf.name,
            tasks = core.queue().len(),
            max_cores = ?wf.settings.max_cores,
            "starting workflow run"
        );

        let mut run = ActiveRun {
            wf,
            state: RunState::new(core),
            registry: self.registry.clone(),
            terminator: self.terminator.clone(),
            armed: true,
        };

        let outcome = match self.drive(&mut *run.wf, &mut run.state).await {
            Ok(Stop::Drained) => SchedulerCore::finish(&mut *run.wf, self.options.set_successful, Utc::now()),
            Ok(Stop::Terminated(reason)) => self.shutdown(&mut *run.wf, &mut run.state, reason).await.map(|()| false),
            Err(e) => {
                error!(workflow = %run.wf.name, error = %e, "workflow run aborted");
                self.terminator.terminate(TerminationReason::Fault);
                if let Err(shutdown_err) = self.shutdown(&mut *run.wf, &mut run.state, TerminationReason::Fault).await {
                    warn!(error = %shutdown_err, "shutdown after fault was incomplete");
                }
                Err(e)
            }
        };

        if outcome.is_err() && run.wf.status.is_active() {
            run.wf.status = WorkflowStatus::Failed;
            run.wf.finished_on = Some(Utc::now());
        }
        run.armed = false;

        self.report_failures(&*run.wf, &run.state);
        self.release_all().await;
        let saved = self.checkpoint(&*run.wf);

        let success = outcome?;
        saved?;
        info!(workflow = %run.wf.name, status = %run.wf.status, success, "workflow run finished");
        Ok(success)
    }

    /// Checks that must pass before anything is submitted.
    fn preflight(&self, wf: &mut Workflow) -> Result<SchedulerCore> {
        wf.number_stages()?;
        let mut core = SchedulerCore::new(wf);
        core.check_budget(wf)?;

        let queued: Vec<TaskId> = core.queue().ids().collect();
        for id in &queued {
            let task = wf.task_or_err(*id)?;
            if !task.is_noop() && !self.registry.contains(&task.drm) {
                let registered: Vec<&str> = self.registry.names().collect();
                error!(task = %task.uid, drm = %task.drm, ?registered, "task targets an unregistered backend");
                return Err(FlowError::UnsupportedDrm(task.drm.clone()));
            }
        }

        // Attempts left in flight by an interrupted earlier run have no live
        // handle any more.
        let now = Utc::now();
        for id in queued {
            if wf.task_or_err(id)?.status.is_in_flight() {
                warn!(task = %wf.task_or_err(id)?.uid, "task left in flight by an earlier run; marking killed");
                apply_task_status(wf, id, TaskStatus::Killed, now)?;
            }
        }

        core.requeue_settled(wf, now)?;
        Ok(core)
    }

    async fn drive(&self, wf: &mut Workflow, state: &mut RunState) -> Result<Stop> {
        loop {
            if let Some(reason) = self.listener.requested() {
                return Ok(Stop::Terminated(reason));
            }

            let noops = state.core.complete_noops(wf, Utc::now())?;
            if noops > 0 {
                debug!(count = noops, "completed no-op tasks");
            }
            if state.core.is_done() {
                return Ok(Stop::Drained);
            }

            let plan = state.core.plan(wf);
            if state.core.is_stalled(wf, &plan) {
                return Err(FlowError::Stalled(format!(
                    "{} task(s) queued but none can be admitted",
                    state.core.queue().len()
                )));
            }

            let rejected = self.submit(wf, state, &plan.admitted).await?;

            if let Some(reason) = self.listener.requested() {
                return Ok(Stop::Terminated(reason));
            }

            let completed = self.poll(wf, state).await?;

            if completed + rejected + noops == 0 {
                let mut listener = self.listener.clone();
                tokio::select! {
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                    _ = listener.wait() => {}
                }
            } else if completed > 0 {
                self.checkpoint(wf)?;
            }
        }
    }

    /// Move admitted tasks through `waiting` to `submitted`, one batch per
    /// backend. Returns how many were rejected before reaching a backend.
    async fn submit(&self, wf: &mut Workflow, state: &mut RunState, admitted: &[TaskId]) -> Result<usize> {
        let mut rejected = 0;
        let mut batches: BTreeMap<String, Vec<TaskSubmission>> = BTreeMap::new();

        for &id in admitted {
            apply_task_status(wf, id, TaskStatus::Waiting, Utc::now())?;

            let task = wf.task_or_err(id)?;
            let stage = wf.stage_name_of(id).to_string();
            let paths = task.paths(&wf.settings.log_dir, &stage);
            let command = task.command.clone().unwrap_or_default();
            let drm = task.drm.clone();
            let submission = TaskSubmission {
                task: id,
                uid: task.uid.clone(),
                job_name: format!("{stage}__{}__{}", task.uid, task.attempt),
                stage,
                attempt: task.attempt,
                paths,
                resources: task.resources,
                drm_options: task.drm_options.clone(),
            };

            if let Err(e) = materialize(&submission.paths, &command) {
                warn!(task = %submission.uid, stage = %submission.stage, error = %e, "could not write task script");
                self.settle(wf, state, id, ResourceUsage::failed(format!("could not write task script: {e}")))?;
                rejected += 1;
                continue;
            }
            batches.entry(drm).or_default().push(submission);
        }

        for (name, jobs) in batches {
            let drm = self.registry.get(&name)?;
            let mut results = drm.submit_jobs(&jobs).await.into_iter();

            for job in jobs {
                let result = results.next().unwrap_or_else(|| {
                    Err(FlowError::Other(anyhow::anyhow!(
                        "drm {name} returned no result for job {}",
                        job.job_name
                    )))
                });
                match result {
                    Ok(handle) => {
                        if let Some(task) = wf.task_mut(job.task) {
                            task.drm_job_id = Some(handle.clone());
                        }
                        apply_task_status(wf, job.task, TaskStatus::Submitted, Utc::now())?;
                        debug!(
                            task = %job.uid,
                            stage = %job.stage,
                            attempt = job.attempt,
                            drm = %name,
                            job_id = %handle,
                            "job accepted"
                        );
                        state.in_flight.insert(
                            job.task,
                            InFlight {
                                drm: name.clone(),
                                job: SubmittedJob {
                                    task: job.task,
                                    job_id: handle,
                                    paths: job.paths,
                                    attempt: job.attempt,
                                },
                            },
                        );
                    }
                    Err(e) => {
                        warn!(task = %job.uid, stage = %job.stage, drm = %name, error = %e, "submission rejected");
                        self.settle(wf, state, job.task, ResourceUsage::failed(e.to_string()))?;
                        rejected += 1;
                    }
                }
            }
        }
        Ok(rejected)
    }

    /// One polling round over every backend with jobs in flight. Returns the
    /// number of completions classified.
    async fn poll(&self, wf: &mut Workflow, state: &mut RunState) -> Result<usize> {
        let mut completed = 0;
        let mut last_fault = None;

        for (name, jobs) in state.jobs_by_drm() {
            let drm = self.registry.get(&name)?;
            match drm.poll_completed(&jobs).await {
                Ok(done) => {
                    for completion in done {
                        let Some(entry) = state.in_flight.remove(&completion.task) else {
                            warn!(drm = %name, task = %completion.task, "completion for a job not in flight");
                            continue;
                        };
                        let usage = merge_profile(completion.usage, &entry.job.paths.profile);
                        debug!(
                            task = %completion.task,
                            drm = %name,
                            job_id = %entry.job.job_id,
                            exit_status = ?usage.exit_status,
                            "job finished"
                        );
                        self.settle(wf, state, completion.task, usage)?;
                        completed += 1;
                    }
                }
                Err(e) => {
                    warn!(drm = %name, jobs = jobs.len(), error = %e, "status query failed; jobs left in flight");
                    last_fault = Some(e);
                }
            }
        }

        match last_fault {
            Some(e) => {
                state.transport_faults += 1;
                if state.transport_faults >= self.options.transport_fault_limit {
                    error!(rounds = state.transport_faults, "giving up after repeated status query failures");
                    return Err(e);
                }
            }
            None => state.transport_faults = 0,
        }
        Ok(completed)
    }

    /// Classify one finished attempt and record terminal failures.
    fn settle(&self, wf: &mut Workflow, state: &mut RunState, id: TaskId, usage: ResourceUsage) -> Result<()> {
        state.in_flight.remove(&id);
        match state.core.classify(wf, id, usage, Utc::now())? {
            Outcome::Succeeded => {}
            Outcome::Retry { attempt } => {
                debug!(task = %id, attempt, "task queued for retry");
            }
            Outcome::FailedCascade { removed } => {
                let descendants = removed.len().saturating_sub(1);
                if descendants > 0 {
                    warn!(
                        task = %wf.task_or_err(id)?.uid,
                        descendants,
                        "required task failed; descendants will not run"
                    );
                }
                state.failed.push(id);
            }
            Outcome::FailedIsolated => state.failed.push(id),
        }
        Ok(())
    }

    /// Controlled shutdown: classify what already finished, kill the rest
    /// and settle stage and workflow status.
    async fn shutdown(&self, wf: &mut Workflow, state: &mut RunState, reason: TerminationReason) -> Result<()> {
        info!(workflow = %wf.name, ?reason, in_flight = state.in_flight.len(), "shutting down workflow run");

        if reason == TerminationReason::Operator && !state.in_flight.is_empty() {
            if let Err(e) = self.poll(wf, state).await {
                warn!(error = %e, "final status poll failed");
            }
        }

        for (name, jobs) in state.jobs_by_drm() {
            let killed = match self.registry.get(&name) {
                Ok(drm) => drm.kill(&jobs).await,
                Err(e) => Err(e),
            };
            if let Err(e) = killed {
                warn!(drm = %name, jobs = jobs.len(), error = %e, "kill request failed; jobs may be orphaned");
            }
        }

        mark_terminated(wf, state, reason, Utc::now())
    }

    fn report_failures(&self, wf: &Workflow, state: &RunState) {
        for id in &state.failed {
            if let Some(report) = FailureReport::collect(wf, *id) {
                error!(stage = %report.stage, task = %report.uid, "task failed\n{report}");
            }
        }
    }

    async fn release_all(&self) {
        for drm in self.registry.iter() {
            if let Err(e) = drm.release().await {
                warn!(drm = %drm.name(), error = %e, "failed to release backend resources");
            }
        }
    }

    fn checkpoint(&self, wf: &Workflow) -> Result<()> {
        match &self.store {
            Some(store) => store.save(wf),
            None => Ok(()),
        }
    }
}

/// Settle task, stage and workflow status once a run stops early.
fn mark_terminated(
    wf: &mut Workflow,
    state: &mut RunState,
    reason: TerminationReason,
    now: DateTime<Utc>,
) -> Result<()> {
    state.in_flight.clear();
    let killed: Vec<TaskId> = wf
        .tasks()
        .filter(|t| t.status.is_in_flight())
        .map(|t| t.id)
        .collect();
    for id in killed {
        apply_task_status(wf, id, TaskStatus::Killed, now)?;
    }

    let active: Vec<_> = wf
        .stages()
        .filter(|s| matches!(s.status, StageStatus::Running | StageStatus::RunningButFailed))
        .map(|s| s.id)
        .collect();
    for id in active {
        apply_stage_status(wf, id, StageStatus::Killed, now)?;
    }

    wf.status = match reason {
        TerminationReason::Operator => WorkflowStatus::Killed,
        TerminationReason::Fault => WorkflowStatus::Failed,
    };
    wf.finished_on = Some(now);
    warn!(workflow = %wf.name, status = %wf.status, "workflow terminated");
    Ok(())
}

/// A run in progress. Dropped while still armed (a panic, or the run future
/// cancelled at an await point), it raises a fault, sends kill requests for
/// every job in flight and settles the workflow as failed.
struct ActiveRun<'a> {
    wf: &'a mut Workflow,
    state: RunState,
    registry: DrmRegistry,
    terminator: Terminator,
    armed: bool,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            workflow = %self.wf.name,
            in_flight = self.state.in_flight.len(),
            "workflow run abandoned; killing jobs in flight"
        );
        self.terminator.terminate(TerminationReason::Fault);

        let jobs = self.state.jobs_by_drm();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                for (name, jobs) in jobs {
                    let Ok(drm) = self.registry.get(&name) else {
                        continue;
                    };
                    handle.spawn(async move {
                        if let Err(e) = drm.kill(&jobs).await {
                            warn!(drm = %name, jobs = jobs.len(), error = %e, "kill request failed; jobs may be orphaned");
                        }
                    });
                }
            }
            Err(_) if !jobs.is_empty() => {
                warn!(backends = jobs.len(), "no runtime left to send kill requests; jobs may be orphaned");
            }
            Err(_) => {}
        }

        if let Err(e) = mark_terminated(&mut *self.wf, &mut self.state, TerminationReason::Fault, Utc::now()) {
            warn!(error = %e, "could not settle status of abandoned run");
        }
    }
}

impl Workflow {
    /// Run this workflow with a private termination channel and no store.
    pub async fn run(&mut self, registry: &DrmRegistry, options: RunOptions) -> Result<bool> {
        Runner::new(registry.clone(), options).run(self).await
    }
}
