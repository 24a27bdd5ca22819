// src/drm/awsbatch.rs

//! AWS Batch backend, driven through the `aws` CLI with JSON output.
//!
//! Each submission registers a job definition that runs the task script
//! inline (`bash -c <script>`) in the configured image, then submits it to
//! the configured job queue. Definitions are deregistered on release.

use std::collections::HashMap;
use std::fs;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::drm::retry::{check_output, check_output_with_backoff};
use crate::drm::usage::ResourceUsage;
use crate::drm::{Completion, Drm, DrmSettings, JobHandle, SubmittedJob, TaskSubmission};
use crate::errors::{FlowError, Result};

/// `describe-jobs` accepts at most this many ids per call.
const DESCRIBE_BATCH: usize = 100;

pub struct AwsBatchDrm {
    settings: DrmSettings,
    job_queue: String,
    image: String,
    /// job id → job definition ARN registered for it.
    definitions: Mutex<HashMap<JobHandle, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterOutput {
    job_definition_arn: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitOutput {
    job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DescribeOutput {
    #[serde(default)]
    pub jobs: Vec<BatchJob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub status_reason: Option<String>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub stopped_at: Option<i64>,
    #[serde(default)]
    pub container: Option<BatchContainer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchContainer {
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl AwsBatchDrm {
    pub fn new(settings: DrmSettings) -> Result<Self> {
        let job_queue = settings
            .job_queue
            .clone()
            .ok_or_else(|| FlowError::ConfigError("drm.awsbatch requires job_queue".into()))?;
        let image = settings
            .image
            .clone()
            .ok_or_else(|| FlowError::ConfigError("drm.awsbatch requires image".into()))?;
        Ok(Self {
            settings,
            job_queue,
            image,
            definitions: Mutex::new(HashMap::new()),
        })
    }

    fn container_properties(&self, job: &TaskSubmission, script: &str) -> serde_json::Value {
        json!({
            "image": self.image,
            "vcpus": job.resources.cores,
            "memory": job.resources.mem_mb.unwrap_or(1024),
            "command": ["bash", "-c", script],
        })
    }

    async fn aws(&self, args: Vec<String>) -> anyhow::Result<String> {
        check_output("aws", &args, self.settings.backoff().timeout).await
    }

    async fn describe(&self, jobs: &[SubmittedJob]) -> Result<Vec<BatchJob>> {
        let mut found = Vec::new();
        for chunk in jobs.chunks(DESCRIBE_BATCH) {
            let mut args = vec![
                "batch".to_string(),
                "describe-jobs".to_string(),
                "--output".to_string(),
                "json".to_string(),
                "--jobs".to_string(),
            ];
            args.extend(chunk.iter().map(|j| j.job_id.clone()));
            let out = check_output_with_backoff("aws", &args, &self.settings.backoff(), false).await?;
            found.extend(parse_describe(&out)?);
        }
        Ok(found)
    }
}

pub fn parse_describe(out: &str) -> Result<Vec<BatchJob>> {
    let parsed: DescribeOutput = serde_json::from_str(out)?;
    Ok(parsed.jobs)
}

/// Usage for a `SUCCEEDED` or `FAILED` job; `None` otherwise.
pub fn terminal_usage(job: &BatchJob) -> Option<ResourceUsage> {
    let default_code = match job.status.as_str() {
        "SUCCEEDED" => 0,
        "FAILED" => 1,
        _ => return None,
    };
    let container = job.container.as_ref();
    let exit_status = container.and_then(|c| c.exit_code).unwrap_or(default_code);
    let wall_time = match (job.started_at, job.stopped_at) {
        (Some(start), Some(stop)) if stop >= start => Some((stop - start) as f64 / 1000.0),
        _ => None,
    };
    let reason = container
        .and_then(|c| c.reason.clone())
        .or_else(|| job.status_reason.clone());
    Some(ResourceUsage {
        exit_status: Some(exit_status),
        wall_time,
        status_reason: reason,
        ..ResourceUsage::default()
    })
}

#[async_trait]
impl Drm for AwsBatchDrm {
    fn name(&self) -> &str {
        "awsbatch"
    }

    async fn submit_job(&self, job: &TaskSubmission) -> Result<JobHandle> {
        let script = fs::read_to_string(&job.paths.command)
            .with_context(|| format!("reading {}", job.paths.command.display()))?;
        let definition_name = job.job_name.replace(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != '_', "_");

        let out = self
            .aws(vec![
                "batch".into(),
                "register-job-definition".into(),
                "--output".into(),
                "json".into(),
                "--job-definition-name".into(),
                definition_name.clone(),
                "--type".into(),
                "container".into(),
                "--container-properties".into(),
                self.container_properties(job, &script).to_string(),
            ])
            .await?;
        let registered: RegisterOutput = serde_json::from_str(&out)?;

        let mut args = vec![
            "batch".to_string(),
            "submit-job".to_string(),
            "--output".to_string(),
            "json".to_string(),
            "--job-name".to_string(),
            definition_name,
            "--job-queue".to_string(),
            self.job_queue.clone(),
            "--job-definition".to_string(),
            registered.job_definition_arn.clone(),
        ];
        args.extend(self.settings.options_for(job));
        let out = self.aws(args).await?;
        let submitted: SubmitOutput = serde_json::from_str(&out)?;
        if submitted.job_id.is_empty() {
            return Err(anyhow!("submit-job returned an empty job id").into());
        }

        info!(task = %job.uid, stage = %job.stage, job_id = %submitted.job_id, "submitted to aws batch");
        self.definitions
            .lock()
            .await
            .insert(submitted.job_id.clone(), registered.job_definition_arn);
        Ok(submitted.job_id)
    }

    async fn poll_completed(&self, jobs: &[SubmittedJob]) -> Result<Vec<Completion>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let described: HashMap<String, BatchJob> = self
            .describe(jobs)
            .await?
            .into_iter()
            .map(|j| (j.job_id.clone(), j))
            .collect();
        Ok(jobs
            .iter()
            .filter_map(|job| {
                let usage = terminal_usage(described.get(&job.job_id)?)?;
                Some(Completion { task: job.task, usage })
            })
            .collect())
    }

    async fn kill(&self, jobs: &[SubmittedJob]) -> Result<()> {
        for job in jobs {
            let args = vec![
                "batch".to_string(),
                "terminate-job".to_string(),
                "--job-id".to_string(),
                job.job_id.clone(),
                "--reason".to_string(),
                "terminated by drmflow".to_string(),
            ];
            if let Err(e) = self.aws(args).await {
                warn!(job_id = %job.job_id, error = %e, "terminate-job failed");
            }
        }
        Ok(())
    }

    async fn statuses(&self, jobs: &[SubmittedJob]) -> HashMap<JobHandle, String> {
        match self.describe(jobs).await {
            Ok(found) => found.into_iter().map(|j| (j.job_id, j.status)).collect(),
            Err(_) => HashMap::new(),
        }
    }

    async fn release(&self) -> Result<()> {
        let mut defs = self.definitions.lock().await;
        for (job_id, arn) in defs.drain() {
            let args = vec![
                "batch".to_string(),
                "deregister-job-definition".to_string(),
                "--job-definition".to_string(),
                arn.clone(),
            ];
            match self.aws(args).await {
                Ok(_) => debug!(%job_id, %arn, "deregistered job definition"),
                Err(e) => warn!(%job_id, %arn, error = %e, "failed to deregister job definition"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIBE: &str = r#"{
      "jobs": [
        {"jobId": "a-1", "jobName": "x", "status": "SUCCEEDED",
         "startedAt": 1000, "stoppedAt": 6500, "container": {"exitCode": 0}},
        {"jobId": "b-2", "jobName": "y", "status": "FAILED",
         "statusReason": "Essential container in task exited",
         "startedAt": 1000, "stoppedAt": 2000, "container": {"exitCode": 137, "reason": "OutOfMemoryError"}},
        {"jobId": "c-3", "jobName": "z", "status": "RUNNABLE"}
      ]
    }"#;

    #[test]
    fn describe_jobs_maps_terminal_states() {
        let jobs = parse_describe(DESCRIBE).unwrap();
        assert_eq!(jobs.len(), 3);

        let ok = terminal_usage(&jobs[0]).unwrap();
        assert!(ok.succeeded());
        assert_eq!(ok.wall_time, Some(5.5));

        let failed = terminal_usage(&jobs[1]).unwrap();
        assert_eq!(failed.exit_status, Some(137));
        assert_eq!(failed.status_reason.as_deref(), Some("OutOfMemoryError"));

        assert!(terminal_usage(&jobs[2]).is_none());
    }

    #[test]
    fn failed_job_without_container_still_fails() {
        let job = BatchJob {
            job_id: "d".into(),
            status: "FAILED".into(),
            status_reason: Some("Job attempt duration exceeded timeout".into()),
            started_at: None,
            stopped_at: None,
            container: None,
        };
        let usage = terminal_usage(&job).unwrap();
        assert_eq!(usage.exit_status, Some(1));
        assert!(usage.wall_time.is_none());
    }

    #[test]
    fn queue_and_image_are_required() {
        assert!(matches!(
            AwsBatchDrm::new(DrmSettings::default()),
            Err(FlowError::ConfigError(_))
        ));
    }
}
