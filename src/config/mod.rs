// src/config/mod.rs

//! TOML workflow files: raw model, validation, loading, and conversion
//! into a declared [`Workflow`](crate::model::Workflow).

pub mod build;
pub mod loader;
pub mod model;
pub mod validate;

pub use build::{build_registry, declare_stages, run_options, workflow_settings};
pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{RawWorkflowFile, StageConfig, WorkflowFile, WorkflowSection};
