// src/drm/ge.rs

//! Grid Engine backend (`qsub` / `qstat` / `qacct` / `qdel`).
//!
//! A job that leaves `qstat` is looked up in accounting with `qacct -j`.
//! Right after a job finishes, `qacct` can return several records for it,
//! some of them half-written. The most recent record that is internally
//! consistent wins. When none is, the job is deferred to a later poll as
//! long as some other job on this backend can still resolve cleanly; the
//! corrupt data is only reported when nothing else is left to wait for.
//! A job that never shows up in accounting is settled as failed after a
//! bounded number of polls.

use std::collections::{BTreeMap, HashMap};

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::drm::missing::MissingJobs;
use crate::drm::retry::{check_output, check_output_with_backoff};
use crate::drm::usage::{ResourceUsage, parse_mem_kb};
use crate::drm::{Completion, Drm, DrmSettings, JobHandle, SubmittedJob, TaskSubmission};
use crate::errors::Result;

pub struct GeDrm {
    settings: DrmSettings,
    missing: MissingJobs,
}

/// One `qacct -j` record as `key → value`.
pub type QacctRecord = BTreeMap<String, String>;

/// What the accounting data says about one finished job.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordChoice {
    Clean(ResourceUsage),
    /// No consistent record; carries the best guess from the latest one.
    Corrupt(ResourceUsage),
}

/// What accounting says about one job that has left `qstat`.
#[derive(Debug, Clone, PartialEq)]
pub enum Accounting {
    Found(RecordChoice),
    /// Not in accounting yet; ask again on the next poll.
    Pending,
    /// Never showed up in accounting.
    Lost(ResourceUsage),
}

impl GeDrm {
    pub fn new(settings: DrmSettings) -> Self {
        Self {
            missing: settings.missing_jobs(),
            settings,
        }
    }

    fn submit_args(&self, job: &TaskSubmission) -> Vec<String> {
        let mut args = vec![
            "-terse".to_string(),
            "-cwd".to_string(),
            "-S".to_string(),
            "/bin/bash".to_string(),
            "-o".to_string(),
            job.paths.stdout.display().to_string(),
            "-e".to_string(),
            job.paths.stderr.display().to_string(),
            "-N".to_string(),
            job.job_name.clone(),
        ];
        args.extend(self.settings.options_for(job));
        args.push(job.paths.command.display().to_string());
        args
    }

    async fn qstat(&self) -> Result<HashMap<String, String>> {
        let out = check_output_with_backoff("qstat", &[], &self.settings.backoff(), true).await?;
        Ok(parse_qstat(&out))
    }

    /// `None` means the job is not in accounting yet.
    async fn qacct(&self, job_id: &str) -> Option<Vec<QacctRecord>> {
        let args = vec!["-j".to_string(), job_id.to_string()];
        match check_output("qacct", &args, self.settings.backoff().timeout).await {
            Ok(out) => Some(parse_qacct(&out)),
            Err(e) => {
                debug!(job_id, error = %e, "qacct has no record yet");
                None
            }
        }
    }
}

/// Parse `-terse` output (`1234` or `1234.1-10:1` for array jobs).
pub fn parse_qsub_output(out: &str) -> Option<String> {
    let line = out.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split('.').next()?;
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

/// Parse `qstat` into job id → state. Header and separator lines are skipped.
pub fn parse_qstat(out: &str) -> HashMap<String, String> {
    out.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let id = *cols.first()?;
            if !id.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            Some((id.to_string(), cols.get(4).copied().unwrap_or("?").to_string()))
        })
        .collect()
}

/// Split `qacct -j` output into records on its `=====` separator lines.
pub fn parse_qacct(out: &str) -> Vec<QacctRecord> {
    let mut records = Vec::new();
    let mut current = QacctRecord::new();
    for line in out.lines() {
        if line.starts_with("====") {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }
        let line = line.trim_end();
        let Some((key, value)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        current.insert(key.to_string(), value.trim().to_string());
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

fn field_f64(record: &QacctRecord, key: &str) -> Option<f64> {
    record.get(key)?.split_whitespace().next()?.parse().ok()
}

fn usage_from_record(record: &QacctRecord) -> ResourceUsage {
    let exit_status = record.get("exit_status").and_then(|v| v.split_whitespace().next()?.parse().ok());
    let failed = record
        .get("failed")
        .and_then(|v| v.split_whitespace().next()?.parse::<i32>().ok())
        .unwrap_or(0);
    ResourceUsage {
        exit_status,
        wall_time: field_f64(record, "ru_wallclock"),
        cpu_time: field_f64(record, "cpu"),
        user_time: field_f64(record, "ru_utime"),
        system_time: field_f64(record, "ru_stime"),
        max_rss_kb: record.get("maxvmem").and_then(|v| parse_mem_kb(v)),
        status_reason: (failed != 0).then(|| format!("failed: {}", record.get("failed").cloned().unwrap_or_default())),
        ..ResourceUsage::default()
    }
}

/// A record is consistent when it belongs to `job_id`, has an exit status,
/// a non-negative wall clock and a real end time.
pub fn is_consistent(job_id: &str, record: &QacctRecord) -> bool {
    let id_matches = record.get("jobnumber").is_some_and(|n| n == job_id);
    let exit_ok = record
        .get("exit_status")
        .and_then(|v| v.split_whitespace().next()?.parse::<i32>().ok())
        .is_some();
    let wall_ok = field_f64(record, "ru_wallclock").is_some_and(|w| w >= 0.0);
    let ended = record
        .get("end_time")
        .is_some_and(|t| !t.is_empty() && t != "-/-");
    id_matches && exit_ok && wall_ok && ended
}

/// Pick the record to trust for `job_id`; `None` for no records at all.
pub fn select_record(job_id: &str, records: &[QacctRecord]) -> Option<RecordChoice> {
    if let Some(clean) = records.iter().rev().find(|r| is_consistent(job_id, r)) {
        return Some(RecordChoice::Clean(usage_from_record(clean)));
    }
    let latest = records.last()?;
    let mut usage = usage_from_record(latest);
    usage.status_reason = Some("corrupt qacct record".to_string());
    Some(RecordChoice::Corrupt(usage))
}

/// Classify one job from its `qacct` records (`None` when the lookup
/// failed), counting polls without a usable answer in `missing`.
pub fn account(job_id: &str, records: Option<Vec<QacctRecord>>, missing: &MissingJobs) -> Accounting {
    match records.and_then(|r| select_record(job_id, &r)) {
        Some(choice) => {
            missing.seen(job_id);
            Accounting::Found(choice)
        }
        None => match missing.absent(job_id, "qacct") {
            Some(usage) => Accounting::Lost(usage),
            None => Accounting::Pending,
        },
    }
}

/// Decide which finished jobs to report this round.
///
/// Corrupt jobs are deferred while another job resolved cleanly this round
/// or is still outstanding on the backend. Returns `(report, deferred)`.
pub fn resolve_round(
    choices: Vec<(JobHandle, RecordChoice)>,
    others_outstanding: bool,
) -> (Vec<(JobHandle, ResourceUsage)>, Vec<JobHandle>) {
    let any_clean = choices.iter().any(|(_, c)| matches!(c, RecordChoice::Clean(_)));
    let defer_corrupt = any_clean || others_outstanding;

    let mut report = Vec::new();
    let mut deferred = Vec::new();
    for (id, choice) in choices {
        match choice {
            RecordChoice::Clean(usage) => report.push((id, usage)),
            RecordChoice::Corrupt(_) if defer_corrupt => deferred.push(id),
            RecordChoice::Corrupt(usage) => report.push((id, usage)),
        }
    }
    (report, deferred)
}

#[async_trait]
impl Drm for GeDrm {
    fn name(&self) -> &str {
        "ge"
    }

    async fn submit_job(&self, job: &TaskSubmission) -> Result<JobHandle> {
        let out = check_output("qsub", &self.submit_args(job), self.settings.backoff().timeout).await?;
        let id = parse_qsub_output(&out).ok_or_else(|| anyhow!("unexpected qsub output: {}", out.trim()))?;
        info!(task = %job.uid, stage = %job.stage, job_id = %id, "submitted to grid engine");
        Ok(id)
    }

    async fn poll_completed(&self, jobs: &[SubmittedJob]) -> Result<Vec<Completion>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let queued = self.qstat().await?;

        let mut choices = Vec::new();
        let mut lost = Vec::new();
        let mut pending_accounting = false;
        for job in jobs {
            if queued.contains_key(&job.job_id) {
                self.missing.seen(&job.job_id);
                continue;
            }
            match account(&job.job_id, self.qacct(&job.job_id).await, &self.missing) {
                Accounting::Found(choice) => choices.push((job.job_id.clone(), choice)),
                Accounting::Pending => pending_accounting = true,
                Accounting::Lost(usage) => lost.push((job.job_id.clone(), usage)),
            }
        }

        let still_queued = jobs.iter().any(|j| queued.contains_key(&j.job_id));
        let (mut report, deferred) = resolve_round(choices, still_queued || pending_accounting);
        report.extend(lost);
        for id in &deferred {
            warn!(job_id = %id, "qacct returned only inconsistent records; deferring");
        }

        let by_id: HashMap<&str, &SubmittedJob> = jobs.iter().map(|j| (j.job_id.as_str(), j)).collect();
        debug!(finished = report.len(), deferred = deferred.len(), "grid engine poll");

        Ok(report
            .into_iter()
            .filter_map(|(id, usage)| {
                by_id.get(id.as_str()).map(|job| Completion { task: job.task, usage })
            })
            .collect())
    }

    async fn kill(&self, jobs: &[SubmittedJob]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let args: Vec<String> = jobs.iter().map(|j| j.job_id.clone()).collect();
        if let Err(e) = check_output("qdel", &args, self.settings.backoff().timeout).await {
            warn!(error = %e, "qdel failed");
        }
        Ok(())
    }

    async fn statuses(&self, jobs: &[SubmittedJob]) -> HashMap<JobHandle, String> {
        let queued = self.qstat().await.unwrap_or_default();
        jobs.iter()
            .map(|j| {
                let state = queued.get(&j.job_id).cloned().unwrap_or_else(|| "finished".to_string());
                (j.job_id.clone(), state)
            })
            .collect()
    }
}
