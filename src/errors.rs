// src/errors.rs

//! Crate-wide error type.
//!
//! Configuration and expansion problems are raised before anything is
//! submitted. Task failures are not errors at all: they are outcomes handled
//! by the scheduler. Transport errors only surface here once an adapter has
//! exhausted its own retries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("Duplicate tags in stage '{stage}': {tags} is already used by a task that has not succeeded")]
    DuplicateTags { stage: String, tags: String },

    #[error("Relationship error in stage '{stage}': {message}")]
    Relationship { stage: String, message: String },

    #[error("Unsupported DRM: {0}")]
    UnsupportedDrm(String),

    #[error("Task {task} requests {requested} cores but the workflow budget is {budget}")]
    ResourceExceedsBudget {
        task: String,
        requested: u32,
        budget: u32,
    },

    #[error("Cycle detected in stage graph: {0}")]
    DagCycle(String),

    #[error("Invalid status transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },

    #[error("Unknown task id: {0}")]
    TaskNotFound(String),

    #[error("Unknown stage: {0}")]
    StageNotFound(String),

    #[error("Status query `{command}` failed after {attempts} attempts: {message}")]
    Transport {
        command: String,
        attempts: u32,
        message: String,
    },

    #[error("Scheduler stalled: {0}")]
    Stalled(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    /// Configuration-class errors must stop a run before any submission.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FlowError::ConfigError(_)
                | FlowError::DuplicateStage(_)
                | FlowError::DuplicateTags { .. }
                | FlowError::Relationship { .. }
                | FlowError::UnsupportedDrm(_)
                | FlowError::ResourceExceedsBudget { .. }
                | FlowError::DagCycle(_)
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FlowError>;
