// src/drm/slurm.rs

//! Slurm backend (`sbatch` / `sacct` / `scancel`).

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::drm::missing::MissingJobs;
use crate::drm::retry::{check_output, check_output_with_backoff};
use crate::drm::usage::{ResourceUsage, parse_duration_secs, parse_mem_kb};
use crate::drm::{Completion, Drm, DrmSettings, JobHandle, SubmittedJob, TaskSubmission};
use crate::errors::Result;

const SACCT_FORMAT: &str = "JobID,State,ExitCode,Elapsed,TotalCPU,MaxRSS";

pub struct SlurmDrm {
    settings: DrmSettings,
    missing: MissingJobs,
}

/// Accounting for one job, aggregated over its steps.
#[derive(Debug, Clone, PartialEq)]
pub struct SacctJob {
    pub state: String,
    pub exit_code: i32,
    pub signal: i32,
    pub elapsed: Option<f64>,
    pub total_cpu: Option<f64>,
    pub max_rss_kb: Option<u64>,
}

/// Normalised view of a Slurm job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlurmState {
    Pending,
    Completed,
    Failed,
}

impl SlurmDrm {
    pub fn new(settings: DrmSettings) -> Self {
        Self {
            missing: settings.missing_jobs(),
            settings,
        }
    }

    fn submit_args(&self, job: &TaskSubmission) -> Vec<String> {
        let mut args = vec![
            "--parsable".to_string(),
            format!("--output={}", job.paths.stdout.display()),
            format!("--error={}", job.paths.stderr.display()),
            format!("--job-name={}", job.job_name),
            format!("--cpus-per-task={}", job.resources.cores),
        ];
        if let Some(mem) = job.resources.mem_mb {
            args.push(format!("--mem={mem}M"));
        }
        if let Some(minutes) = job.resources.time_min {
            args.push(format!("--time={minutes}"));
        }
        args.extend(self.settings.options_for(job));
        args.push(job.paths.command.display().to_string());
        args
    }

    async fn sacct(&self, jobs: &[SubmittedJob]) -> Result<HashMap<String, SacctJob>> {
        let ids: Vec<&str> = jobs.iter().map(|j| j.job_id.as_str()).collect();
        let args = vec![
            "--parsable2".to_string(),
            "--noheader".to_string(),
            format!("--format={SACCT_FORMAT}"),
            "-j".to_string(),
            ids.join(","),
        ];
        // Freshly submitted jobs may not be in accounting yet.
        let out = check_output_with_backoff("sacct", &args, &self.settings.backoff(), true).await?;
        Ok(parse_sacct(&out))
    }
}

/// `1234` or `1234;cluster`.
pub fn parse_sbatch_output(out: &str) -> Option<String> {
    let id = out.trim().split(';').next()?.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

/// Map a raw `State` column (`CANCELLED by 1000`, `OUT_OF_MEMORY`, ...).
pub fn normalise_state(raw: &str) -> SlurmState {
    let state = raw.split_whitespace().next().unwrap_or("").trim_end_matches('+');
    match state {
        "COMPLETED" => SlurmState::Completed,
        "FAILED" | "CANCELLED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" | "PREEMPTED" | "BOOT_FAIL"
        | "DEADLINE" => SlurmState::Failed,
        _ => SlurmState::Pending,
    }
}

fn parse_exit_code(raw: &str) -> (i32, i32) {
    let mut parts = raw.split(':');
    let code = parts.next().and_then(|c| c.parse().ok()).unwrap_or(0);
    let signal = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (code, signal)
}

/// Parse `sacct --parsable2` lines into per-job records.
///
/// The allocation line (`1234`) carries state and exit code; step lines
/// (`1234.batch`, `1234.0`) only contribute their peak memory.
pub fn parse_sacct(out: &str) -> HashMap<String, SacctJob> {
    let mut jobs: HashMap<String, SacctJob> = HashMap::new();
    let mut step_rss: HashMap<String, u64> = HashMap::new();

    for line in out.lines().filter(|l| !l.trim().is_empty()) {
        let cols: Vec<&str> = line.split('|').collect();
        if cols.len() < 6 {
            continue;
        }
        let (base, is_step) = match cols[0].split_once('.') {
            Some((base, _)) => (base, true),
            None => (cols[0], false),
        };
        let rss = parse_mem_kb(cols[5]);

        if is_step {
            if let Some(rss) = rss {
                let entry = step_rss.entry(base.to_string()).or_default();
                *entry = (*entry).max(rss);
            }
            continue;
        }

        let (exit_code, signal) = parse_exit_code(cols[2]);
        jobs.insert(
            base.to_string(),
            SacctJob {
                state: cols[1].to_string(),
                exit_code,
                signal,
                elapsed: parse_duration_secs(cols[3]),
                total_cpu: parse_duration_secs(cols[4]),
                max_rss_kb: rss,
            },
        );
    }

    for (id, rss) in step_rss {
        if let Some(job) = jobs.get_mut(&id) {
            job.max_rss_kb = Some(job.max_rss_kb.unwrap_or(0).max(rss));
        }
    }
    jobs
}

/// Usage for a finished job; `None` while it is still pending or running.
pub fn terminal_usage(job: &SacctJob) -> Option<ResourceUsage> {
    let state = normalise_state(&job.state);
    if state == SlurmState::Pending {
        return None;
    }

    let mut usage = ResourceUsage {
        exit_status: Some(job.exit_code),
        wall_time: job.elapsed,
        cpu_time: job.total_cpu,
        max_rss_kb: job.max_rss_kb,
        status_reason: Some(job.state.clone()),
        ..ResourceUsage::default()
    };
    if state == SlurmState::Failed && job.exit_code == 0 {
        // Cancelled, timed-out and OOM jobs often report 0:<sig>.
        usage.term_signal = (job.signal != 0).then_some(job.signal);
        usage.exit_status = Some(if job.signal != 0 { 128 + job.signal } else { 1 });
    }
    Some(usage)
}

/// Usage for `job_id` if accounting shows it finished. A job that stays
/// out of `sacct` for too many polls is settled as failed.
pub fn completion_usage(
    records: &HashMap<String, SacctJob>,
    job_id: &str,
    missing: &MissingJobs,
) -> Option<ResourceUsage> {
    match records.get(job_id) {
        Some(job) => {
            missing.seen(job_id);
            terminal_usage(job)
        }
        None => missing.absent(job_id, "sacct"),
    }
}

#[async_trait]
impl Drm for SlurmDrm {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn submit_job(&self, job: &TaskSubmission) -> Result<JobHandle> {
        let out = check_output("sbatch", &self.submit_args(job), self.settings.backoff().timeout).await?;
        let id = parse_sbatch_output(&out).ok_or_else(|| anyhow!("unexpected sbatch output: {}", out.trim()))?;
        info!(task = %job.uid, stage = %job.stage, job_id = %id, "submitted to slurm");
        Ok(id)
    }

    async fn poll_completed(&self, jobs: &[SubmittedJob]) -> Result<Vec<Completion>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let records = self.sacct(jobs).await?;
        Ok(jobs
            .iter()
            .filter_map(|job| {
                let usage = completion_usage(&records, &job.job_id, &self.missing)?;
                Some(Completion { task: job.task, usage })
            })
            .collect())
    }

    async fn kill(&self, jobs: &[SubmittedJob]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let args: Vec<String> = jobs.iter().map(|j| j.job_id.clone()).collect();
        if let Err(e) = check_output("scancel", &args, self.settings.backoff().timeout).await {
            warn!(error = %e, "scancel failed");
        }
        Ok(())
    }

    async fn statuses(&self, jobs: &[SubmittedJob]) -> HashMap<JobHandle, String> {
        if jobs.is_empty() {
            return HashMap::new();
        }
        match self.sacct(jobs).await {
            Ok(records) => records.into_iter().map(|(id, job)| (id, job.state)).collect(),
            Err(_) => HashMap::new(),
        }
    }
}
