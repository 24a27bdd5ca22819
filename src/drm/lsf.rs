// src/drm/lsf.rs

//! IBM Spectrum LSF backend (`bsub` / `bjobs` / `bkill`).

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::drm::missing::MissingJobs;
use crate::drm::retry::{check_output, check_output_with_backoff};
use crate::drm::usage::ResourceUsage;
use crate::drm::{Completion, Drm, DrmSettings, JobHandle, SubmittedJob, TaskSubmission};
use crate::errors::Result;

pub struct LsfDrm {
    settings: DrmSettings,
    missing: MissingJobs,
}

impl LsfDrm {
    pub fn new(settings: DrmSettings) -> Self {
        Self {
            missing: settings.missing_jobs(),
            settings,
        }
    }

    fn submit_args(&self, job: &TaskSubmission) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            job.paths.stdout.display().to_string(),
            "-e".to_string(),
            job.paths.stderr.display().to_string(),
            "-J".to_string(),
            job.job_name.clone(),
            "-n".to_string(),
            job.resources.cores.to_string(),
        ];
        if let Some(mem) = job.resources.mem_mb {
            args.push("-M".to_string());
            args.push(mem.to_string());
        }
        if let Some(minutes) = job.resources.time_min {
            args.push("-W".to_string());
            args.push(minutes.to_string());
        }
        args.extend(self.settings.options_for(job));
        args.push("bash".to_string());
        args.push(job.paths.command.display().to_string());
        args
    }

    async fn bjobs(&self, jobs: &[SubmittedJob]) -> Result<HashMap<String, String>> {
        let mut args = vec!["-a".to_string(), "-w".to_string()];
        args.extend(jobs.iter().map(|j| j.job_id.clone()));
        let out = check_output_with_backoff("bjobs", &args, &self.settings.backoff(), false).await?;
        Ok(parse_bjobs(&out))
    }
}

/// Extract the id from `Job <1234> is submitted to queue <normal>.`
pub fn parse_bsub_output(out: &str) -> Option<String> {
    let start = out.find("Job <")? + "Job <".len();
    let rest = &out[start..];
    let end = rest.find('>')?;
    let id = &rest[..end];
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

/// Parse `bjobs -w` output into job id → STAT.
pub fn parse_bjobs(out: &str) -> HashMap<String, String> {
    out.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let id = cols.next()?;
            let _user = cols.next()?;
            let stat = cols.next()?;
            id.chars()
                .all(|c| c.is_ascii_digit())
                .then(|| (id.to_string(), stat.to_string()))
        })
        .collect()
}

/// Map an LSF STAT to a completion, if it is terminal.
pub fn terminal_usage(stat: &str) -> Option<ResourceUsage> {
    match stat {
        "DONE" => Some(ResourceUsage::with_exit_status(0)),
        "EXIT" => Some(ResourceUsage {
            status_reason: Some("EXIT".to_string()),
            ..ResourceUsage::with_exit_status(1)
        }),
        _ => None,
    }
}

/// Usage for `job_id` if this `bjobs` table shows it finished. LSF purges
/// finished jobs after a while, so a job absent for too long is settled as
/// failed rather than waited on.
pub fn completion_usage(
    table: &HashMap<String, String>,
    job_id: &str,
    missing: &MissingJobs,
) -> Option<ResourceUsage> {
    match table.get(job_id) {
        Some(stat) => {
            missing.seen(job_id);
            terminal_usage(stat)
        }
        None => missing.absent(job_id, "bjobs"),
    }
}

#[async_trait]
impl Drm for LsfDrm {
    fn name(&self) -> &str {
        "lsf"
    }

    async fn submit_job(&self, job: &TaskSubmission) -> Result<JobHandle> {
        let out = check_output("bsub", &self.submit_args(job), self.settings.backoff().timeout).await?;
        let id = parse_bsub_output(&out).ok_or_else(|| anyhow!("unexpected bsub output: {}", out.trim()))?;
        info!(task = %job.uid, stage = %job.stage, job_id = %id, "submitted to lsf");
        Ok(id)
    }

    async fn poll_completed(&self, jobs: &[SubmittedJob]) -> Result<Vec<Completion>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.bjobs(jobs).await?;
        Ok(jobs
            .iter()
            .filter_map(|job| {
                let usage = completion_usage(&table, &job.job_id, &self.missing)?;
                Some(Completion { task: job.task, usage })
            })
            .collect())
    }

    async fn kill(&self, jobs: &[SubmittedJob]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let args: Vec<String> = jobs.iter().map(|j| j.job_id.clone()).collect();
        if let Err(e) = check_output("bkill", &args, self.settings.backoff().timeout).await {
            warn!(error = %e, "bkill failed");
        }
        Ok(())
    }

    async fn statuses(&self, jobs: &[SubmittedJob]) -> HashMap<JobHandle, String> {
        if jobs.is_empty() {
            return HashMap::new();
        }
        self.bjobs(jobs).await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bsub_id_is_extracted() {
        assert_eq!(
            parse_bsub_output("Job <8812> is submitted to queue <normal>.\n"),
            Some("8812".to_string())
        );
        assert_eq!(parse_bsub_output("Request aborted by esub."), None);
    }

    #[test]
    fn bjobs_table_maps_ids_to_stat() {
        let out = "\
JOBID   USER    STAT  QUEUE      FROM_HOST   EXEC_HOST   JOB_NAME   SUBMIT_TIME
101     alice   DONE  normal     login1      node7       a__1       Oct  1 10:00
102     alice   EXIT  normal     login1      node8       b__1       Oct  1 10:00
103     alice   RUN   normal     login1      node9       c__1       Oct  1 10:01
";
        let table = parse_bjobs(out);
        assert_eq!(table.len(), 3);
        assert!(terminal_usage(&table["101"]).unwrap().succeeded());
        assert_eq!(terminal_usage(&table["102"]).unwrap().exit_status, Some(1));
        assert!(terminal_usage(&table["103"]).is_none());
    }

    #[test]
    fn purged_job_is_failed_after_the_limit() {
        let missing = MissingJobs::new(2);
        let running = parse_bjobs("201     alice   RUN   normal  login1  node1  a__1  Oct  1 10:00\n");
        let purged = HashMap::new();

        assert!(completion_usage(&purged, "201", &missing).is_none());
        // Seen again: the count starts over.
        assert!(completion_usage(&running, "201", &missing).is_none());
        assert!(completion_usage(&purged, "201", &missing).is_none());
        let usage = completion_usage(&purged, "201", &missing).unwrap();
        assert!(!usage.succeeded());
        assert!(usage.status_reason.unwrap().contains("bjobs"));
    }
}
