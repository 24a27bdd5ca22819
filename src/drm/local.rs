// src/drm/local.rs

//! Local-process backend: one `bash` child per task attempt.
//!
//! Each attempt leads its own process group, so killing a task also reaches
//! whatever its script started in the background.

use std::collections::HashMap;
use std::fs::File;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::drm::usage::ResourceUsage;
use crate::drm::{Completion, Drm, JobHandle, SubmittedJob, TaskSubmission};
use crate::errors::Result;

pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Signals sent, in order, when killing a task.
const KILL_LADDER: [&str; 3] = ["INT", "TERM", "KILL"];

struct LocalJob {
    child: Child,
    started: Instant,
}

pub struct LocalDrm {
    procs: Mutex<HashMap<JobHandle, LocalJob>>,
    kill_grace: Duration,
}

impl LocalDrm {
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            procs: Mutex::new(HashMap::new()),
            kill_grace,
        }
    }
}

impl Default for LocalDrm {
    fn default() -> Self {
        Self::new(DEFAULT_KILL_GRACE)
    }
}

fn usage_from_status(status: ExitStatus, wall: Duration) -> ResourceUsage {
    let mut usage = ResourceUsage {
        wall_time: Some(wall.as_secs_f64()),
        ..ResourceUsage::default()
    };
    match status.code() {
        Some(code) => usage.exit_status = Some(code),
        None => {
            let signal = term_signal(&status);
            usage.term_signal = signal;
            usage.exit_status = Some(128 + signal.unwrap_or(0));
            usage.status_reason = Some("terminated by signal".to_string());
        }
    }
    usage
}

#[cfg(unix)]
fn term_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn term_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Send `signal` to the process group led by `pid` through the `kill`
/// utility. Failures are logged; the group may already be gone.
async fn signal_group(pid: &str, signal: &str) {
    let group = format!("-{pid}");
    let res = Command::new("kill")
        .args(["-s", signal, "--", &group])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = res {
        debug!(pid, signal, error = %e, "failed to send signal");
    }
}

#[async_trait]
impl Drm for LocalDrm {
    fn name(&self) -> &str {
        "local"
    }

    async fn submit_job(&self, job: &TaskSubmission) -> Result<JobHandle> {
        let stdout = File::create(&job.paths.stdout)
            .with_context(|| format!("creating {}", job.paths.stdout.display()))?;
        let stderr = File::create(&job.paths.stderr)
            .with_context(|| format!("creating {}", job.paths.stderr.display()))?;

        let mut command = Command::new("bash");
        command
            .arg(&job.paths.command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let child = command
            .spawn()
            .with_context(|| format!("spawning {}", job.paths.command.display()))?;

        let pid = child
            .id()
            .map(|p| p.to_string())
            .with_context(|| format!("no pid for {}", job.job_name))?;

        info!(task = %job.uid, stage = %job.stage, attempt = job.attempt, pid = %pid, "spawned local task");

        self.procs.lock().await.insert(
            pid.clone(),
            LocalJob {
                child,
                started: Instant::now(),
            },
        );
        Ok(pid)
    }

    async fn poll_completed(&self, jobs: &[SubmittedJob]) -> Result<Vec<Completion>> {
        let mut procs = self.procs.lock().await;
        let mut done = Vec::new();

        for job in jobs {
            let Some(local) = procs.get_mut(&job.job_id) else {
                warn!(job_id = %job.job_id, "local job is not tracked; reporting it as lost");
                done.push(Completion {
                    task: job.task,
                    usage: ResourceUsage::failed("local process lost"),
                });
                continue;
            };

            match local.child.try_wait() {
                Ok(Some(status)) => {
                    let usage = usage_from_status(status, local.started.elapsed());
                    debug!(job_id = %job.job_id, exit_status = ?usage.exit_status, "local task exited");
                    procs.remove(&job.job_id);
                    done.push(Completion { task: job.task, usage });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "try_wait failed; reporting failure");
                    procs.remove(&job.job_id);
                    done.push(Completion {
                        task: job.task,
                        usage: ResourceUsage::failed(format!("wait failed: {e}")),
                    });
                }
            }
        }
        Ok(done)
    }

    async fn kill(&self, jobs: &[SubmittedJob]) -> Result<()> {
        let mut procs = self.procs.lock().await;
        for job in jobs {
            let Some(mut local) = procs.remove(&job.job_id) else {
                continue;
            };

            let mut exited = false;
            for signal in KILL_LADDER {
                if matches!(local.child.try_wait(), Ok(Some(_))) {
                    exited = true;
                    break;
                }
                signal_group(&job.job_id, signal).await;
                if timeout(self.kill_grace, local.child.wait()).await.is_ok() {
                    debug!(job_id = %job.job_id, signal, "local task exited after signal");
                    exited = true;
                    break;
                }
            }

            if exited {
                // Background processes may have outlived the script.
                signal_group(&job.job_id, "KILL").await;
            } else if let Err(e) = local.child.kill().await {
                warn!(job_id = %job.job_id, error = %e, "failed to kill local task");
            }
        }
        Ok(())
    }

    async fn statuses(&self, jobs: &[SubmittedJob]) -> HashMap<JobHandle, String> {
        let mut procs = self.procs.lock().await;
        jobs.iter()
            .map(|job| {
                let status = match procs.get_mut(&job.job_id).map(|l| l.child.try_wait()) {
                    Some(Ok(None)) => "running".to_string(),
                    Some(Ok(Some(s))) => format!("exited ({s})"),
                    Some(Err(e)) => format!("unknown ({e})"),
                    None => "not tracked".to_string(),
                };
                (job.job_id.clone(), status)
            })
            .collect()
    }

    async fn release(&self) -> Result<()> {
        let mut procs = self.procs.lock().await;
        if !procs.is_empty() {
            warn!(count = procs.len(), "releasing local backend with live processes");
        }
        procs.clear();
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::drm::script::{TaskPaths, materialize};
    use crate::model::{Resources, TaskId};

    fn submission(dir: &std::path::Path, uid: &str, cmd: &str) -> TaskSubmission {
        let paths = TaskPaths::new(dir, "s", uid, 1);
        materialize(&paths, cmd).unwrap();
        TaskSubmission {
            task: TaskId(1),
            uid: uid.into(),
            stage: "s".into(),
            attempt: 1,
            paths,
            resources: Resources::default(),
            drm_options: None,
            job_name: format!("s__{uid}__1"),
        }
    }

    async fn wait_for(drm: &LocalDrm, job: &SubmittedJob) -> Completion {
        for _ in 0..200 {
            let mut done = drm.poll_completed(std::slice::from_ref(job)).await.unwrap();
            if let Some(c) = done.pop() {
                return c;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("local job did not finish");
    }

    #[tokio::test]
    async fn exit_codes_and_output_are_captured() {
        let dir = tempfile::tempdir().unwrap();
        let drm = LocalDrm::default();
        let sub = submission(dir.path(), "a", "echo hello\nexit 3");
        let job_id = drm.submit_job(&sub).await.unwrap();
        let job = SubmittedJob {
            task: sub.task,
            job_id,
            paths: sub.paths.clone(),
            attempt: 1,
        };

        let done = wait_for(&drm, &job).await;
        assert_eq!(done.usage.exit_status, Some(3));
        let out = std::fs::read_to_string(&sub.paths.stdout).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn strict_preamble_fails_on_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let drm = LocalDrm::default();
        let sub = submission(dir.path(), "b", "false | true\necho unreachable");
        let job_id = drm.submit_job(&sub).await.unwrap();
        let job = SubmittedJob {
            task: sub.task,
            job_id,
            paths: sub.paths.clone(),
            attempt: 1,
        };
        let done = wait_for(&drm, &job).await;
        assert_eq!(done.usage.exit_status, Some(1));
        assert!(std::fs::read_to_string(&sub.paths.stdout).unwrap().is_empty());
    }

    #[tokio::test]
    async fn kill_stops_a_running_task() {
        let dir = tempfile::tempdir().unwrap();
        let drm = LocalDrm::new(Duration::from_millis(200));
        let sub = submission(dir.path(), "c", "sleep 30");
        let job_id = drm.submit_job(&sub).await.unwrap();
        let job = SubmittedJob {
            task: sub.task,
            job_id: job_id.clone(),
            paths: sub.paths.clone(),
            attempt: 1,
        };

        assert_eq!(drm.statuses(std::slice::from_ref(&job)).await[&job_id], "running");
        drm.kill(std::slice::from_ref(&job)).await.unwrap();
        assert_eq!(drm.statuses(std::slice::from_ref(&job)).await[&job_id], "not tracked");
    }

    #[cfg(target_os = "linux")]
    fn is_gone(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // Reaped, or a zombie waiting for its new parent.
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn kill_reaches_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let drm = LocalDrm::new(Duration::from_millis(200));
        let pid_file = dir.path().join("bg.pid");
        let sub = submission(
            dir.path(),
            "d",
            &format!("sleep 30 &\necho $! > {}\nwait", pid_file.display()),
        );
        let job_id = drm.submit_job(&sub).await.unwrap();
        let job = SubmittedJob {
            task: sub.task,
            job_id,
            paths: sub.paths.clone(),
            attempt: 1,
        };

        let mut bg = String::new();
        for _ in 0..200 {
            bg = std::fs::read_to_string(&pid_file).unwrap_or_default().trim().to_string();
            if !bg.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!bg.is_empty(), "background pid was never written");
        assert!(!is_gone(&bg));

        drm.kill(std::slice::from_ref(&job)).await.unwrap();
        for _ in 0..200 {
            if is_gone(&bg) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background process {bg} survived the kill");
    }
}
