// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{RawWorkflowFile, WorkflowFile};
use crate::errors::Result;

/// Read a workflow file without semantic validation.
///
/// Use [`load_and_validate`] unless you need the raw TOML mapping.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawWorkflowFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    let raw: RawWorkflowFile = toml::from_str(&contents)?;
    Ok(raw)
}

/// Read and validate a workflow file.
///
/// Checks stage names, parents, acyclicity, pattern parameters, DRM names
/// and resource requests. Command templates are only checked when the
/// stages are expanded.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<WorkflowFile> {
    let raw = load_from_path(&path)?;
    WorkflowFile::try_from(raw)
}

/// `Drmflow.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Drmflow.toml")
}
