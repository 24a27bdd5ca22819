// src/state/stage.rs

//! Stage status: an aggregate of its tasks' statuses.

use chrono::{DateTime, Utc};
use tracing::Level;

use crate::errors::{FlowError, Result};
use crate::model::{StageId, Task, Workflow};
use crate::state::{SideEffect, TimestampKind, emit};
use crate::types::{StageStatus, TaskStatus};

/// Aggregate status for a stage's tasks.
///
/// - any task killed: `killed`
/// - any required task failed for good: `running_but_failed`
/// - every task successful, or failed but optional: `successful`
/// - any task started: `running`
/// - otherwise the stage keeps `current`
pub fn aggregate(tasks: &[&Task], current: StageStatus) -> StageStatus {
    if tasks.iter().any(|t| t.status == TaskStatus::Killed) {
        return StageStatus::Killed;
    }
    if tasks
        .iter()
        .any(|t| t.status == TaskStatus::Failed && t.must_succeed)
    {
        return StageStatus::RunningButFailed;
    }
    let all_done = !tasks.is_empty()
        && tasks.iter().all(|t| {
            t.status == TaskStatus::Successful || (t.status == TaskStatus::Failed && !t.must_succeed)
        });
    if all_done {
        return StageStatus::Successful;
    }
    let started = tasks
        .iter()
        .any(|t| t.status != TaskStatus::NoAttempt || t.attempt > 1);
    if started {
        return StageStatus::Running;
    }
    current
}

/// Validate a stage status change and compute its side effects.
///
/// Finished stages only move between `running_but_failed`, `failed` and
/// `killed`, or back to `no_attempt` when a later run reopens them.
/// Successful stages are frozen.
pub fn stage_transition(name: &str, from: StageStatus, to: StageStatus) -> Result<Vec<SideEffect>> {
    use StageStatus::*;

    if from == to {
        return Ok(Vec::new());
    }
    let allowed = match from {
        NoAttempt | Running => true,
        RunningButFailed => matches!(to, Failed | Killed | NoAttempt),
        Failed | Killed => to == NoAttempt,
        Successful => false,
    };
    if !allowed {
        return Err(FlowError::InvalidTransition {
            subject: format!("stage {name}"),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let mut effects = Vec::new();
    if from == NoAttempt {
        effects.push(SideEffect::Timestamp(TimestampKind::Started));
    }
    if to.is_finished() {
        effects.push(SideEffect::Timestamp(TimestampKind::Finished));
    }
    let level = match to {
        Successful | Running => Level::INFO,
        RunningButFailed | Killed => Level::WARN,
        Failed => Level::ERROR,
        NoAttempt => Level::INFO,
    };
    effects.push(SideEffect::log(level, format!("stage {name} {from} -> {to}")));
    Ok(effects)
}

/// Move a stage to `to`, applying timestamps and logging.
pub fn apply_stage_status(wf: &mut Workflow, id: StageId, to: StageStatus, now: DateTime<Utc>) -> Result<()> {
    let (name, from) = {
        let stage = wf.stage_or_err(id)?;
        (stage.name.clone(), stage.status)
    };
    let effects = stage_transition(&name, from, to)?;

    if let Some(stage) = wf.stage_mut(id) {
        stage.status = to;
        if to == StageStatus::NoAttempt {
            stage.finished_on = None;
        }
        for effect in &effects {
            match effect {
                SideEffect::Timestamp(TimestampKind::Started) => {
                    stage.started_on.get_or_insert(now);
                }
                SideEffect::Timestamp(TimestampKind::Finished) => stage.finished_on = Some(now),
                SideEffect::Log { level, message } => emit(*level, message),
                _ => {}
            }
        }
    }
    Ok(())
}

/// Recompute a stage's status from its tasks.
pub fn refresh_stage(wf: &mut Workflow, id: StageId, now: DateTime<Utc>) -> Result<StageStatus> {
    let current = wf.stage_or_err(id)?.status;
    let next = aggregate(&wf.stage_tasks(id), current);
    if next != current {
        apply_stage_status(wf, id, next, now)?;
    }
    Ok(next)
}
