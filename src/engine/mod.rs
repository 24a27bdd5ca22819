// src/engine/mod.rs

//! Scheduling engine.
//!
//! The pure scheduler lives in [`core`] (admission, classification, final
//! status) on top of the working [`queue`]. The async IO shell that talks to
//! DRM backends is [`runner`]; [`terminate`] carries operator and fault
//! termination into it, and [`report`] renders terminal failures.

pub mod core;
pub mod queue;
pub mod report;
pub mod runner;
pub mod terminate;

pub use self::core::{Admission, Outcome, SchedulerCore, admit};
pub use queue::TaskQueue;
pub use report::FailureReport;
pub use runner::{RunOptions, Runner};
pub use terminate::{
    TerminationListener, TerminationReason, Terminator, spawn_ctrl_c, termination_channel,
};
