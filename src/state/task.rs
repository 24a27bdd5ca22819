// src/state/task.rs

//! Task status transitions.

use chrono::{DateTime, Utc};
use tracing::Level;

use crate::errors::{FlowError, Result};
use crate::model::{Task, TaskId, Workflow};
use crate::state::stage::refresh_stage;
use crate::state::{SideEffect, TimestampKind, emit};
use crate::types::TaskStatus;

/// A validated task status change and what applying it entails.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: TaskStatus,
    /// Status actually stored. A retryable failure requests `Failed` but
    /// lands on `NoAttempt`.
    pub to: TaskStatus,
    pub effects: Vec<SideEffect>,
}

fn invalid(task: &Task, to: TaskStatus) -> FlowError {
    FlowError::InvalidTransition {
        subject: format!("task {}", task.uid),
        from: task.status.to_string(),
        to: to.to_string(),
    }
}

/// Validate `task.status → requested` and compute its side effects.
///
/// Legal moves:
///
/// - `no_attempt → waiting → submitted → {successful, failed}`
/// - `no_attempt → successful` for no-op tasks
/// - `waiting → failed` when submission is rejected
/// - any non-terminal status `→ killed`
/// - `{killed, failed} → no_attempt` when a later run picks the task up
///   again; the owning stage is reopened by the caller
pub fn task_transition(task: &Task, requested: TaskStatus) -> Result<Transition> {
    use TaskStatus::*;

    let from = task.status;
    let mut effects = Vec::new();

    let to = match (from, requested) {
        (NoAttempt, Waiting) => {
            effects.push(SideEffect::Timestamp(TimestampKind::Started));
            requested
        }
        (Waiting, Submitted) => {
            effects.push(SideEffect::Timestamp(TimestampKind::Submitted));
            effects.push(SideEffect::log(
                Level::INFO,
                format!("submitted task {} (attempt {})", task.uid, task.attempt),
            ));
            effects.push(SideEffect::RefreshStage);
            requested
        }
        (Submitted, Successful) | (NoAttempt, Successful) => {
            if from == NoAttempt && !task.is_noop() {
                return Err(invalid(task, requested));
            }
            effects.push(SideEffect::Timestamp(TimestampKind::Finished));
            effects.push(SideEffect::log(Level::INFO, format!("task {} successful", task.uid)));
            effects.push(SideEffect::RefreshStage);
            requested
        }
        (Submitted, Failed) | (Waiting, Failed) => {
            effects.push(SideEffect::Timestamp(TimestampKind::Finished));
            if task.must_succeed && task.attempts_remaining() {
                effects.push(SideEffect::log(
                    Level::WARN,
                    format!(
                        "task {} failed on attempt {}/{}; retrying",
                        task.uid, task.attempt, task.max_attempts
                    ),
                ));
                effects.push(SideEffect::IncrementAttempt);
                NoAttempt
            } else {
                let level = if task.must_succeed { Level::ERROR } else { Level::WARN };
                effects.push(SideEffect::log(
                    level,
                    format!(
                        "task {} failed permanently after {} attempt(s){}",
                        task.uid,
                        task.attempt,
                        if task.must_succeed { "" } else { " (not required to succeed)" }
                    ),
                ));
                effects.push(SideEffect::RefreshStage);
                Failed
            }
        }
        (NoAttempt | Waiting | Submitted, Killed) => {
            effects.push(SideEffect::Timestamp(TimestampKind::Finished));
            effects.push(SideEffect::log(Level::WARN, format!("task {} killed", task.uid)));
            effects.push(SideEffect::RefreshStage);
            requested
        }
        (Killed | Failed, NoAttempt) => {
            effects.push(SideEffect::ResetAttempts);
            effects.push(SideEffect::log(
                Level::INFO,
                format!("task {} requeued after {from} attempt {}", task.uid, task.attempt),
            ));
            requested
        }
        _ => return Err(invalid(task, requested)),
    };

    Ok(Transition { from, to, effects })
}

/// Apply a task transition to the arena and return the stored status.
pub fn apply_task_status(
    wf: &mut Workflow,
    id: TaskId,
    requested: TaskStatus,
    now: DateTime<Utc>,
) -> Result<TaskStatus> {
    let transition = task_transition(wf.task_or_err(id)?, requested)?;
    let stage = wf.task_or_err(id)?.stage;

    let mut refresh = false;
    if let Some(task) = wf.task_mut(id) {
        task.status = transition.to;
        for effect in &transition.effects {
            match effect {
                SideEffect::Timestamp(TimestampKind::Started) => task.started_on = Some(now),
                SideEffect::Timestamp(TimestampKind::Submitted) => task.submitted_on = Some(now),
                SideEffect::Timestamp(TimestampKind::Finished) => task.finished_on = Some(now),
                SideEffect::IncrementAttempt => {
                    task.attempt += 1;
                    task.drm_job_id = None;
                }
                SideEffect::ResetAttempts => {
                    task.attempt = 1;
                    task.drm_job_id = None;
                    task.usage = None;
                    task.started_on = None;
                    task.submitted_on = None;
                    task.finished_on = None;
                }
                SideEffect::Log { level, message } => emit(*level, message),
                SideEffect::RefreshStage => refresh = true,
            }
        }
    }

    if refresh {
        refresh_stage(wf, stage, now)?;
    }
    Ok(transition.to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskSpec, WorkflowSettings};
    use crate::types::{StageStatus, tags};

    fn one_task(max_attempts: u32, must_succeed: bool) -> (Workflow, TaskId) {
        let mut wf = Workflow::new("w", WorkflowSettings::default());
        let s = wf.add_stage("s", &[]).unwrap();
        let id = wf
            .add_task(
                s,
                TaskSpec::new(tags([("x", 1)]))
                    .command("true")
                    .max_attempts(max_attempts)
                    .must_succeed(must_succeed),
            )
            .unwrap();
        (wf, id)
    }

    #[test]
    fn happy_path_timestamps_and_stage() {
        let (mut wf, id) = one_task(1, true);
        let now = Utc::now();
        apply_task_status(&mut wf, id, TaskStatus::Waiting, now).unwrap();
        apply_task_status(&mut wf, id, TaskStatus::Submitted, now).unwrap();
        let stage = wf.task(id).unwrap().stage;
        assert_eq!(wf.stage(stage).unwrap().status, StageStatus::Running);
        assert!(wf.stage(stage).unwrap().started_on.is_some());

        apply_task_status(&mut wf, id, TaskStatus::Successful, now).unwrap();
        let task = wf.task(id).unwrap();
        assert!(task.started_on.is_some() && task.submitted_on.is_some() && task.finished_on.is_some());
        assert_eq!(wf.stage(stage).unwrap().status, StageStatus::Successful);
        assert!(wf.stage(stage).unwrap().finished_on.is_some());
    }

    #[test]
    fn failure_with_attempts_left_loops_back() {
        let (mut wf, id) = one_task(2, true);
        let now = Utc::now();
        apply_task_status(&mut wf, id, TaskStatus::Waiting, now).unwrap();
        apply_task_status(&mut wf, id, TaskStatus::Submitted, now).unwrap();
        let stored = apply_task_status(&mut wf, id, TaskStatus::Failed, now).unwrap();
        assert_eq!(stored, TaskStatus::NoAttempt);
        assert_eq!(wf.task(id).unwrap().attempt, 2);

        apply_task_status(&mut wf, id, TaskStatus::Waiting, now).unwrap();
        apply_task_status(&mut wf, id, TaskStatus::Submitted, now).unwrap();
        let stored = apply_task_status(&mut wf, id, TaskStatus::Failed, now).unwrap();
        assert_eq!(stored, TaskStatus::Failed);
        let stage = wf.task(id).unwrap().stage;
        assert_eq!(wf.stage(stage).unwrap().status, StageStatus::RunningButFailed);
    }

    #[test]
    fn optional_failure_does_not_fail_the_stage() {
        let (mut wf, id) = one_task(3, false);
        let now = Utc::now();
        apply_task_status(&mut wf, id, TaskStatus::Waiting, now).unwrap();
        apply_task_status(&mut wf, id, TaskStatus::Submitted, now).unwrap();
        assert_eq!(
            apply_task_status(&mut wf, id, TaskStatus::Failed, now).unwrap(),
            TaskStatus::Failed
        );
        let stage = wf.task(id).unwrap().stage;
        assert_eq!(wf.stage(stage).unwrap().status, StageStatus::Successful);
    }

    #[test]
    fn illegal_moves_are_rejected() {
        let (mut wf, id) = one_task(1, true);
        let err = apply_task_status(&mut wf, id, TaskStatus::Submitted, Utc::now()).unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));
        // A task with a command cannot skip straight to success.
        assert!(task_transition(wf.task(id).unwrap(), TaskStatus::Successful).is_err());

        wf.task_mut(id).unwrap().status = TaskStatus::Successful;
        assert!(task_transition(wf.task(id).unwrap(), TaskStatus::Killed).is_err());
    }

    #[test]
    fn retry_transition_lists_its_effects() {
        let (mut wf, id) = one_task(2, true);
        wf.task_mut(id).unwrap().status = TaskStatus::Submitted;
        let t = task_transition(wf.task(id).unwrap(), TaskStatus::Failed).unwrap();
        assert_eq!(t.from, TaskStatus::Submitted);
        assert_eq!(t.to, TaskStatus::NoAttempt);
        assert!(t.effects.contains(&SideEffect::IncrementAttempt));
        assert!(!t.effects.contains(&SideEffect::RefreshStage));
    }

    #[test]
    fn killed_task_is_requeued_from_the_first_attempt() {
        let (mut wf, id) = one_task(3, true);
        let now = Utc::now();
        apply_task_status(&mut wf, id, TaskStatus::Waiting, now).unwrap();
        apply_task_status(&mut wf, id, TaskStatus::Submitted, now).unwrap();
        apply_task_status(&mut wf, id, TaskStatus::Failed, now).unwrap();
        apply_task_status(&mut wf, id, TaskStatus::Waiting, now).unwrap();
        apply_task_status(&mut wf, id, TaskStatus::Killed, now).unwrap();
        assert_eq!(wf.task(id).unwrap().attempt, 2);

        let t = task_transition(wf.task(id).unwrap(), TaskStatus::NoAttempt).unwrap();
        assert!(t.effects.contains(&SideEffect::ResetAttempts));
        assert!(!t.effects.contains(&SideEffect::RefreshStage));

        apply_task_status(&mut wf, id, TaskStatus::NoAttempt, now).unwrap();
        let task = wf.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::NoAttempt);
        assert_eq!(task.attempt, 1);
        assert!(task.started_on.is_none() && task.finished_on.is_none());

        wf.task_mut(id).unwrap().status = TaskStatus::Successful;
        assert!(task_transition(wf.task(id).unwrap(), TaskStatus::NoAttempt).is_err());
    }
}
