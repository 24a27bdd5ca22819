// src/state/mod.rs

//! Task and stage status state machines.
//!
//! Transitions are computed by pure functions that return the side effects
//! they imply; `apply_*` executes those effects on the workflow arena. Only
//! the runner calls the `apply_*` functions, and it owns workflow-level
//! status itself.

pub mod stage;
pub mod task;

pub use stage::{aggregate, apply_stage_status, refresh_stage, stage_transition};
pub use task::{Transition, apply_task_status, task_transition};

use tracing::{Level, debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampKind {
    Started,
    Submitted,
    Finished,
}

/// One consequence of a status transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    Log { level: Level, message: String },
    Timestamp(TimestampKind),
    /// Bump the attempt counter for a retry.
    IncrementAttempt,
    /// Start over from attempt 1 with no record of earlier attempts.
    ResetAttempts,
    /// Recompute the owning stage's aggregate status.
    RefreshStage,
}

impl SideEffect {
    pub fn log(level: Level, message: impl Into<String>) -> Self {
        SideEffect::Log {
            level,
            message: message.into(),
        }
    }
}

pub(crate) fn emit(level: Level, message: &str) {
    match level {
        Level::ERROR => error!("{message}"),
        Level::WARN => warn!("{message}"),
        Level::INFO => info!("{message}"),
        Level::DEBUG => debug!("{message}"),
        _ => trace!("{message}"),
    }
}
