// src/drm/profile.rs

//! Reader for `profile_attempt<N>.json`, the resource report written next to
//! a task's output by the per-process sampler.
//!
//! The report is read after the backend says the job finished. Whatever it
//! contains takes precedence over backend-derived numbers, since it was
//! measured inside the job.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::drm::usage::ResourceUsage;
use crate::errors::Result;

#[derive(Debug, Default, Deserialize)]
struct ProfileReport {
    #[serde(default)]
    exit_status: Option<i32>,
    #[serde(default)]
    term_signal: Option<i32>,
    #[serde(default)]
    wall_time: Option<f64>,
    #[serde(default)]
    cpu_time: Option<f64>,
    #[serde(default)]
    user_time: Option<f64>,
    #[serde(default)]
    system_time: Option<f64>,
    #[serde(default, alias = "max_rss")]
    max_rss_kb: Option<u64>,
    #[serde(default, alias = "avg_rss_mem")]
    avg_rss_kb: Option<u64>,
    #[serde(default)]
    percent_cpu: Option<f64>,
}

impl From<ProfileReport> for ResourceUsage {
    fn from(p: ProfileReport) -> Self {
        ResourceUsage {
            exit_status: p.exit_status,
            term_signal: p.term_signal,
            wall_time: p.wall_time,
            cpu_time: p.cpu_time,
            user_time: p.user_time,
            system_time: p.system_time,
            max_rss_kb: p.max_rss_kb,
            avg_rss_kb: p.avg_rss_kb,
            percent_cpu: p.percent_cpu,
            status_reason: None,
        }
    }
}

/// Read a profile report. A missing file is not an error.
pub fn read_profile(path: &Path) -> Result<Option<ResourceUsage>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }
    let report: ProfileReport = serde_json::from_str(&contents)?;
    debug!(path = %path.display(), "read profile report");
    Ok(Some(report.into()))
}

/// Merge backend usage with the profile report at `path`, if one exists.
///
/// A malformed report is logged and ignored.
pub fn merge_profile(backend: ResourceUsage, path: &Path) -> ResourceUsage {
    match read_profile(path) {
        Ok(Some(profile)) => backend.overlay(&profile).finalize(),
        Ok(None) => backend.finalize(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable profile report");
            backend.finalize()
        }
    }
}
