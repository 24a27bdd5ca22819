use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use drmflow::drm::usage::ResourceUsage;
use drmflow::drm::{Completion, Drm, JobHandle, SubmittedJob, TaskSubmission};
use drmflow::errors::{FlowError, Result};
use drmflow::model::TaskId;

/// One accepted submission, as seen by the fake backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub task: TaskId,
    pub stage: String,
    pub uid: String,
    pub attempt: u32,
    pub job_id: JobHandle,
    pub cores: u32,
}

#[derive(Debug, Clone)]
struct RunningJob {
    key: String,
    uid: String,
    exit: i32,
    cores: u32,
}

#[derive(Debug, Default)]
struct FakeState {
    /// Exit codes per task key, consumed one per attempt. The last code
    /// repeats once the sequence runs out.
    exits: HashMap<String, VecDeque<i32>>,
    rejected: HashSet<String>,
    held: HashSet<String>,
    failing_polls: u32,
    running: BTreeMap<JobHandle, RunningJob>,
    peak_cores: u32,
    submissions: Vec<SubmissionRecord>,
    killed: Vec<JobHandle>,
    polls: u32,
    next_id: u64,
}

/// A scripted in-memory DRM.
///
/// - every job exits 0 unless scripted otherwise
/// - jobs finish on the first poll after submission, unless held
/// - tasks are addressed by `uid` or `stage/uid`
///
/// Clones share state, so a test can keep one handle while the runner owns
/// another.
#[derive(Debug, Clone)]
pub struct FakeDrm {
    name: String,
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeDrm {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDrm {
    /// A fake registered under the name `local`.
    pub fn new() -> Self {
        Self::named("local")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    pub fn handle(&self) -> Arc<dyn Drm> {
        Arc::new(self.clone())
    }

    /// Every attempt of `task` exits with `code`.
    pub fn exit_with(&self, task: &str, code: i32) -> &Self {
        self.exit_sequence(task, [code])
    }

    /// Attempt N of `task` exits with the Nth code.
    pub fn exit_sequence(&self, task: &str, codes: impl IntoIterator<Item = i32>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .exits
            .insert(task.to_string(), codes.into_iter().collect());
        self
    }

    /// Submissions of `task` are rejected by the backend.
    pub fn reject(&self, task: &str) -> &Self {
        self.state.lock().unwrap().rejected.insert(task.to_string());
        self
    }

    /// Jobs of `task` stay running until [`FakeDrm::release_task`].
    pub fn hold(&self, task: &str) -> &Self {
        self.state.lock().unwrap().held.insert(task.to_string());
        self
    }

    pub fn release_task(&self, task: &str) -> &Self {
        self.state.lock().unwrap().held.remove(task);
        self
    }

    /// The next `n` polls fail with a transport error.
    pub fn fail_polls(&self, n: u32) -> &Self {
        self.state.lock().unwrap().failing_polls = n;
        self
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().unwrap().submissions.len()
    }

    /// Number of attempts submitted for `task`.
    pub fn attempts(&self, task: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .submissions
            .iter()
            .filter(|s| s.uid == task || format!("{}/{}", s.stage, s.uid) == task)
            .count()
    }

    pub fn killed(&self) -> Vec<JobHandle> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().unwrap().running.len()
    }

    /// Largest sum of cores held by running jobs at any point.
    pub fn peak_cores(&self) -> u32 {
        self.state.lock().unwrap().peak_cores
    }

    pub fn poll_count(&self) -> u32 {
        self.state.lock().unwrap().polls
    }
}

fn matching_key<'a>(keys: impl Iterator<Item = &'a String>, stage: &str, uid: &str) -> Option<String> {
    let full = format!("{stage}/{uid}");
    let keys: Vec<&String> = keys.collect();
    keys.iter()
        .find(|k| ***k == full)
        .or_else(|| keys.iter().find(|k| k.as_str() == uid))
        .map(|k| (*k).clone())
}

impl FakeState {
    fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }

    fn next_exit(&mut self, stage: &str, uid: &str) -> i32 {
        let Some(key) = matching_key(self.exits.keys(), stage, uid) else {
            return 0;
        };
        let Some(codes) = self.exits.get_mut(&key) else {
            return 0;
        };
        match codes.len() {
            0 => 0,
            1 => codes[0],
            _ => codes.pop_front().unwrap_or(0),
        }
    }
}

#[async_trait]
impl Drm for FakeDrm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_job(&self, job: &TaskSubmission) -> Result<JobHandle> {
        let mut state = self.state.lock().unwrap();
        if matching_key(state.rejected.iter(), &job.stage, &job.uid).is_some() {
            return Err(FlowError::Other(anyhow::anyhow!(
                "fake backend rejected {}",
                job.job_name
            )));
        }

        state.next_id += 1;
        let job_id = format!("fake-{}", state.next_id);
        let code = state.next_exit(&job.stage, &job.uid);
        state.running.insert(
            job_id.clone(),
            RunningJob {
                key: format!("{}/{}", job.stage, job.uid),
                uid: job.uid.clone(),
                exit: code,
                cores: job.resources.cores,
            },
        );
        let running_cores = state.running.values().map(|r| r.cores).sum();
        state.peak_cores = state.peak_cores.max(running_cores);
        state.submissions.push(SubmissionRecord {
            task: job.task,
            stage: job.stage.clone(),
            uid: job.uid.clone(),
            attempt: job.attempt,
            job_id: job_id.clone(),
            cores: job.resources.cores,
        });
        Ok(job_id)
    }

    async fn poll_completed(&self, jobs: &[SubmittedJob]) -> Result<Vec<Completion>> {
        let mut state = self.state.lock().unwrap();
        state.polls += 1;
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(FlowError::Transport {
                command: "fake-status".to_string(),
                attempts: 1,
                message: "scripted poll failure".to_string(),
            });
        }

        let mut done = Vec::new();
        for job in jobs {
            let Some(running) = state.running.get(&job.job_id).cloned() else {
                continue;
            };
            if state.is_held(&running.key) || state.is_held(&running.uid) {
                continue;
            }
            state.running.remove(&job.job_id);
            let mut usage = ResourceUsage::with_exit_status(running.exit);
            usage.wall_time = Some(0.0);
            usage.status_reason = Some(if running.exit == 0 { "DONE" } else { "EXIT" }.to_string());
            done.push(Completion { task: job.task, usage });
        }
        Ok(done)
    }

    async fn kill(&self, jobs: &[SubmittedJob]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for job in jobs {
            state.running.remove(&job.job_id);
            state.killed.push(job.job_id.clone());
        }
        Ok(())
    }

    async fn statuses(&self, jobs: &[SubmittedJob]) -> HashMap<JobHandle, String> {
        let state = self.state.lock().unwrap();
        jobs.iter()
            .map(|j| {
                let status = if state.running.contains_key(&j.job_id) { "running" } else { "done" };
                (j.job_id.clone(), status.to_string())
            })
            .collect()
    }
}
