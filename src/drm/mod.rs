// src/drm/mod.rs

//! DRM adapters: the uniform interface over job-execution backends.
//!
//! The runner talks to a [`Drm`] trait object per backend name instead of
//! shelling out itself. Adapters receive read-only views of the tasks they
//! run ([`TaskSubmission`], [`SubmittedJob`]) and hand back job handles and
//! resource usage; task status is only ever changed by the runner.
//!
//! - [`local::LocalDrm`] forks the task script directly.
//! - [`lsf::LsfDrm`], [`ge::GeDrm`] and [`slurm::SlurmDrm`] shell out to the
//!   cluster's submit/status/kill commands.
//! - [`awsbatch::AwsBatchDrm`] drives AWS Batch through the `aws` CLI.
//!
//! Tests plug in their own implementation (see `drmflow-test-utils`).

pub mod awsbatch;
pub mod ge;
pub mod local;
pub mod lsf;
pub mod missing;
pub mod profile;
pub mod retry;
pub mod script;
pub mod slurm;
pub mod usage;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{FlowError, Result};
use crate::model::{Resources, TaskId};

use self::missing::{DEFAULT_MISSING_POLL_LIMIT, MissingJobs};
use self::retry::BackoffPolicy;
use self::script::TaskPaths;
use self::usage::ResourceUsage;

/// Opaque backend job identifier.
pub type JobHandle = String;

/// Backend names understood by [`build_drm`].
pub const KNOWN_DRMS: &[&str] = &["local", "lsf", "ge", "slurm", "awsbatch"];

/// Everything a backend needs to launch one attempt of one task.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub task: TaskId,
    pub uid: String,
    pub stage: String,
    pub attempt: u32,
    pub paths: TaskPaths,
    pub resources: Resources,
    pub drm_options: Option<String>,
    /// Human-readable job name (`<stage>__<uid>__<attempt>`).
    pub job_name: String,
}

/// A task attempt that a backend has accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedJob {
    pub task: TaskId,
    pub job_id: JobHandle,
    pub paths: TaskPaths,
    pub attempt: u32,
}

/// A finished attempt as reported by its backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub task: TaskId,
    pub usage: ResourceUsage,
}

/// Per-backend settings from the `[drm.<name>]` tables of a workflow file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DrmSettings {
    /// Submission options applied to tasks that carry none of their own.
    #[serde(default)]
    pub native_spec: Option<String>,
    /// Attempts for status queries before a transport error is raised.
    #[serde(default)]
    pub status_retries: Option<u32>,
    /// AWS Batch job queue.
    #[serde(default)]
    pub job_queue: Option<String>,
    /// AWS Batch container image.
    #[serde(default)]
    pub image: Option<String>,
    /// Grace window between kill signals for local processes.
    #[serde(default)]
    pub kill_grace_ms: Option<u64>,
    /// Consecutive polls a job may go unreported by the backend's status
    /// command before its attempt is settled as failed.
    #[serde(default)]
    pub missing_poll_limit: Option<u32>,
}

impl DrmSettings {
    pub fn backoff(&self) -> BackoffPolicy {
        let policy = BackoffPolicy::default();
        match self.status_retries {
            Some(n) => policy.with_attempts(n),
            None => policy,
        }
    }

    pub fn missing_jobs(&self) -> MissingJobs {
        MissingJobs::new(self.missing_poll_limit.unwrap_or(DEFAULT_MISSING_POLL_LIMIT))
    }

    /// Options for one submission: the task's own, else the backend default.
    pub fn options_for(&self, job: &TaskSubmission) -> Vec<String> {
        split_options(job.drm_options.as_deref().or(self.native_spec.as_deref()))
    }
}

/// Whitespace-split a native option string. Quoting is not interpreted.
pub fn split_options(opts: Option<&str>) -> Vec<String> {
    opts.map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Uniform contract over job-execution backends.
#[async_trait]
pub trait Drm: Send + Sync {
    fn name(&self) -> &str;

    /// Launch one task attempt and return its backend handle.
    async fn submit_job(&self, job: &TaskSubmission) -> Result<JobHandle>;

    /// Launch a batch. Each job gets its own result so one rejected
    /// submission does not lose the handles of the others.
    async fn submit_jobs(&self, jobs: &[TaskSubmission]) -> Vec<Result<JobHandle>> {
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            out.push(self.submit_job(job).await);
        }
        out
    }

    /// Report which of `jobs` have finished, with backend-derived usage.
    ///
    /// Jobs not mentioned are still running (or their status is
    /// indeterminate). A transport failure after retries is an `Err`; the
    /// caller must leave every job in flight.
    async fn poll_completed(&self, jobs: &[SubmittedJob]) -> Result<Vec<Completion>>;

    /// Best-effort termination.
    async fn kill(&self, jobs: &[SubmittedJob]) -> Result<()>;

    /// Backend status strings, for diagnostics only.
    async fn statuses(&self, jobs: &[SubmittedJob]) -> HashMap<JobHandle, String>;

    /// Drop any backend-side resources held for the workflow.
    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Construct the adapter for a backend name.
pub fn build_drm(name: &str, settings: &DrmSettings) -> Result<Arc<dyn Drm>> {
    let drm: Arc<dyn Drm> = match name {
        "local" => Arc::new(local::LocalDrm::new(
            settings
                .kill_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(local::DEFAULT_KILL_GRACE),
        )),
        "lsf" => Arc::new(lsf::LsfDrm::new(settings.clone())),
        "ge" => Arc::new(ge::GeDrm::new(settings.clone())),
        "slurm" => Arc::new(slurm::SlurmDrm::new(settings.clone())),
        "awsbatch" => Arc::new(awsbatch::AwsBatchDrm::new(settings.clone())?),
        other => return Err(FlowError::UnsupportedDrm(other.to_string())),
    };
    Ok(drm)
}

/// Backends available to a run, by name.
#[derive(Clone, Default)]
pub struct DrmRegistry {
    drms: BTreeMap<String, Arc<dyn Drm>>,
}

impl std::fmt::Debug for DrmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmRegistry")
            .field("drms", &self.drms.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DrmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `drm` under its own name, replacing any previous entry.
    pub fn register(&mut self, drm: Arc<dyn Drm>) -> &mut Self {
        self.drms.insert(drm.name().to_string(), drm);
        self
    }

    pub fn with(mut self, drm: Arc<dyn Drm>) -> Self {
        self.register(drm);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Drm>> {
        self.drms
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::UnsupportedDrm(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drms.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.drms.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Drm>> {
        self.drms.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_is_rejected() {
        let err = build_drm("pbs", &DrmSettings::default()).err().unwrap();
        assert!(matches!(err, FlowError::UnsupportedDrm(name) if name == "pbs"));
    }

    #[test]
    fn registry_resolves_by_name() {
        let reg = DrmRegistry::new().with(build_drm("local", &DrmSettings::default()).unwrap());
        assert!(reg.contains("local"));
        assert_eq!(reg.get("local").unwrap().name(), "local");
        assert!(matches!(reg.get("slurm"), Err(FlowError::UnsupportedDrm(_))));
    }

    #[test]
    fn task_options_win_over_backend_default() {
        let settings = DrmSettings {
            native_spec: Some("-p short".into()),
            ..DrmSettings::default()
        };
        let mut job = TaskSubmission {
            task: TaskId(1),
            uid: "u".into(),
            stage: "s".into(),
            attempt: 1,
            paths: TaskPaths::new(std::path::Path::new("/tmp"), "s", "u", 1),
            resources: Resources::default(),
            drm_options: None,
            job_name: "s__u__1".into(),
        };
        assert_eq!(settings.options_for(&job), vec!["-p", "short"]);
        job.drm_options = Some("--qos=high".into());
        assert_eq!(settings.options_for(&job), vec!["--qos=high"]);
    }
}
