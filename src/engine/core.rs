// src/engine/core.rs

//! Pure scheduler core.
//!
//! Synchronous and deterministic: no Tokio, no processes, no filesystem.
//! It owns the working [`TaskQueue`] and decides
//! - which ready tasks to admit under the core budget
//! - what a finished attempt means for the task, its descendants and the
//!   workflow status
//!
//! The async [`Runner`](super::runner::Runner) performs the IO around it.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::drm::usage::ResourceUsage;
use crate::engine::queue::TaskQueue;
use crate::errors::{FlowError, Result};
use crate::model::{TaskId, Workflow};
use crate::state::{apply_stage_status, apply_task_status, refresh_stage};
use crate::types::{StageStatus, TaskStatus, WorkflowStatus};

/// Result of one admission pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    pub admitted: Vec<TaskId>,
    pub deferred: Vec<TaskId>,
}

/// What a finished attempt did to the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Back in the queue for attempt `attempt`.
    Retry { attempt: u32 },
    /// Required task failed for good; these tasks left the queue.
    FailedCascade { removed: Vec<TaskId> },
    /// Optional task failed for good; only it left the queue.
    FailedIsolated,
}

/// Greedy admission under a core budget.
///
/// Ready tasks are sorted ascending by requested cores and taken from the
/// large end; each task is admitted if it still fits in what is left of the
/// budget, otherwise it waits for a later pass. Results keep the order of
/// `ready`.
pub fn admit(ready: &[(TaskId, u32)], cores_in_flight: u32, max_cores: Option<u32>) -> Admission {
    let Some(max) = max_cores else {
        return Admission {
            admitted: ready.iter().map(|(id, _)| *id).collect(),
            deferred: Vec::new(),
        };
    };

    let mut order: Vec<usize> = (0..ready.len()).collect();
    order.sort_by_key(|&i| (ready[i].1, Reverse(i)));

    let mut left = max.saturating_sub(cores_in_flight);
    let mut take = vec![false; ready.len()];
    while let Some(i) = order.pop() {
        let cores = ready[i].1;
        if cores <= left {
            left -= cores;
            take[i] = true;
        }
    }

    let mut admission = Admission::default();
    for (i, (id, _)) in ready.iter().enumerate() {
        if take[i] {
            admission.admitted.push(*id);
        } else {
            admission.deferred.push(*id);
        }
    }
    admission
}

#[derive(Debug, Clone)]
pub struct SchedulerCore {
    queue: TaskQueue,
    max_cores: Option<u32>,
}

impl SchedulerCore {
    pub fn new(wf: &Workflow) -> Self {
        Self {
            queue: TaskQueue::from_workflow(wf),
            max_cores: wf.settings.max_cores,
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn is_done(&self) -> bool {
        self.queue.is_empty()
    }

    /// Fail fast on any queued task that could never be admitted.
    pub fn check_budget(&self, wf: &Workflow) -> Result<()> {
        let Some(budget) = self.max_cores else {
            return Ok(());
        };
        for id in self.queue.ids() {
            let task = wf.task_or_err(id)?;
            if !task.is_noop() && task.resources.cores > budget {
                return Err(FlowError::ResourceExceedsBudget {
                    task: format!("{}/{}", wf.stage_name_of(id), task.uid),
                    requested: task.resources.cores,
                    budget,
                });
            }
        }
        Ok(())
    }

    /// Settle what an earlier run on the same workflow left behind.
    ///
    /// Optional tasks that failed stay failed and leave the queue. Killed
    /// tasks and failed required tasks start over from attempt 1 and their
    /// stages are reopened, so unfinished work is never taken for done.
    pub fn requeue_settled(&mut self, wf: &mut Workflow, now: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let mut requeued = Vec::new();
        let ids: Vec<TaskId> = self.queue.ids().collect();
        for id in ids {
            let task = wf.task_or_err(id)?;
            match task.status {
                TaskStatus::Failed if !task.must_succeed => {
                    self.queue.remove(id);
                }
                TaskStatus::Failed | TaskStatus::Killed => requeued.push(id),
                _ => {}
            }
        }
        if requeued.is_empty() {
            return Ok(requeued);
        }

        let mut stages = BTreeSet::new();
        for id in &requeued {
            apply_task_status(wf, *id, TaskStatus::NoAttempt, now)?;
            stages.insert(wf.task_or_err(*id)?.stage);
        }
        for stage in stages {
            apply_stage_status(wf, stage, StageStatus::NoAttempt, now)?;
            refresh_stage(wf, stage, now)?;
        }
        info!(count = requeued.len(), "requeued tasks left unfinished by an earlier run");
        Ok(requeued)
    }

    /// Queued tasks whose parents are all done and that have not been
    /// started, ordered by stage number then task id.
    pub fn select_ready(&self, wf: &Workflow) -> Vec<TaskId> {
        let mut ready: Vec<(u32, TaskId)> = self
            .queue
            .ready()
            .into_iter()
            .filter_map(|id| {
                let task = wf.task(id)?;
                (task.status == TaskStatus::NoAttempt)
                    .then(|| (wf.stage(task.stage).map_or(0, |s| s.number), id))
            })
            .collect();
        ready.sort();
        ready.into_iter().map(|(_, id)| id).collect()
    }

    /// Cores held by queued tasks that are waiting or submitted.
    pub fn cores_in_flight(&self, wf: &Workflow) -> u32 {
        self.queue
            .ids()
            .filter_map(|id| wf.task(id))
            .filter(|t| t.status.is_in_flight())
            .map(|t| t.resources.cores)
            .sum()
    }

    /// Succeed every ready no-op task, repeating while that releases more.
    pub fn complete_noops(&mut self, wf: &mut Workflow, now: DateTime<Utc>) -> Result<usize> {
        let mut completed = 0;
        loop {
            let noops: Vec<TaskId> = self
                .select_ready(wf)
                .into_iter()
                .filter(|id| wf.task(*id).is_some_and(|t| t.is_noop()))
                .collect();
            if noops.is_empty() {
                return Ok(completed);
            }
            for id in noops {
                apply_task_status(wf, id, TaskStatus::Successful, now)?;
                self.queue.remove(id);
                completed += 1;
            }
        }
    }

    /// Ready, runnable tasks split into admitted and deferred.
    pub fn plan(&self, wf: &Workflow) -> Admission {
        let ready: Vec<(TaskId, u32)> = self
            .select_ready(wf)
            .into_iter()
            .filter_map(|id| wf.task(id))
            .filter(|t| !t.is_noop())
            .map(|t| (t.id, t.resources.cores))
            .collect();
        let in_flight = self.cores_in_flight(wf);
        let admission = admit(&ready, in_flight, self.max_cores);
        if !admission.deferred.is_empty() {
            debug!(
                admitted = admission.admitted.len(),
                deferred = admission.deferred.len(),
                cores_in_flight = in_flight,
                "core budget deferred ready tasks"
            );
        }
        admission
    }

    /// Whether the queue can make no further progress.
    pub fn is_stalled(&self, wf: &Workflow, plan: &Admission) -> bool {
        !self.queue.is_empty()
            && plan.admitted.is_empty()
            && !self.queue.ids().filter_map(|id| wf.task(id)).any(|t| t.status.is_in_flight())
    }

    /// Apply a finished attempt to the task, the queue and the workflow.
    pub fn classify(
        &mut self,
        wf: &mut Workflow,
        id: TaskId,
        usage: ResourceUsage,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let succeeded = usage.succeeded();
        if let Some(task) = wf.task_mut(id) {
            task.usage = Some(usage);
        }

        if succeeded {
            apply_task_status(wf, id, TaskStatus::Successful, now)?;
            self.queue.remove(id);
            return Ok(Outcome::Succeeded);
        }

        let stored = apply_task_status(wf, id, TaskStatus::Failed, now)?;
        let task = wf.task_or_err(id)?;
        if stored == TaskStatus::NoAttempt {
            return Ok(Outcome::Retry { attempt: task.attempt });
        }

        if task.must_succeed {
            let removed = self.queue.remove_with_descendants(id);
            if wf.status == WorkflowStatus::Running {
                wf.status = WorkflowStatus::FailedButRunning;
                warn!(workflow = %wf.name, "required task failed; workflow is failed_but_running");
            }
            debug!(task = %id, removed = removed.len(), "removed failed task and descendants");
            Ok(Outcome::FailedCascade { removed })
        } else {
            self.queue.remove(id);
            Ok(Outcome::FailedIsolated)
        }
    }

    /// Settle stage and workflow status once the queue is empty.
    ///
    /// Returns whether the run succeeded.
    pub fn finish(wf: &mut Workflow, set_successful: bool, now: DateTime<Utc>) -> Result<bool> {
        let failed_stages: Vec<_> = wf
            .stages()
            .filter(|s| s.status == StageStatus::RunningButFailed)
            .map(|s| s.id)
            .collect();
        for id in &failed_stages {
            apply_stage_status(wf, *id, StageStatus::Failed, now)?;
        }

        let failed = !failed_stages.is_empty()
            || wf.status == WorkflowStatus::FailedButRunning
            || wf.stages().any(|s| s.status == StageStatus::Failed);

        if failed {
            wf.status = WorkflowStatus::Failed;
            wf.finished_on = Some(now);
            warn!(workflow = %wf.name, "workflow failed");
        } else if set_successful {
            wf.status = WorkflowStatus::Successful;
            wf.finished_on = Some(now);
            info!(workflow = %wf.name, "workflow successful");
        } else {
            info!(workflow = %wf.name, "run finished; workflow left running for further extension");
        }
        Ok(!failed)
    }
}
