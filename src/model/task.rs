// src/model/task.rs

//! Task records and the spec used to create them.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::drm::script::TaskPaths;
use crate::drm::usage::ResourceUsage;
use crate::model::ids::{StageId, TaskId};
use crate::types::{TagValue, Tags, TaskStatus, format_tags, tags_uid};

/// Resource requirements of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cores: u32,
    /// Memory in megabytes.
    pub mem_mb: Option<u64>,
    /// Wall-time limit in minutes.
    pub time_min: Option<u64>,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cores: 1,
            mem_mb: None,
            time_min: None,
        }
    }
}

/// A unit of executable work, owned by a stage inside the workflow arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub stage: StageId,
    /// Stable key within the stage, derived from `tags`.
    pub uid: String,
    pub tags: Tags,
    /// Shell command. `None` marks a no-op task which succeeds without
    /// being submitted anywhere.
    pub command: Option<String>,
    pub resources: Resources,
    pub status: TaskStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub must_succeed: bool,
    pub drm: String,
    /// Backend-specific submission options, passed through verbatim.
    pub drm_options: Option<String>,
    pub drm_job_id: Option<String>,
    pub usage: Option<ResourceUsage>,
    pub parents: Vec<TaskId>,
    pub children: Vec<TaskId>,
    pub started_on: Option<DateTime<Utc>>,
    pub submitted_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_noop(&self) -> bool {
        self.command.is_none()
    }

    /// Whether a failure of the current attempt may still be retried.
    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Log file layout for the current attempt.
    pub fn paths(&self, log_dir: &Path, stage_name: &str) -> TaskPaths {
        TaskPaths::new(log_dir, stage_name, &self.uid, self.attempt)
    }

    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }

    pub fn describe(&self) -> String {
        format!("{} {}", self.uid, format_tags(&self.tags))
    }
}

/// Everything needed to add a task to a stage.
///
/// Fields left as `None` fall back to workflow defaults.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub tags: Tags,
    pub command: Option<String>,
    pub resources: Resources,
    pub must_succeed: Option<bool>,
    pub drm: Option<String>,
    pub drm_options: Option<String>,
    pub max_attempts: Option<u32>,
    pub parents: Vec<TaskId>,
}

impl TaskSpec {
    pub fn new(tags: Tags) -> Self {
        Self {
            tags,
            ..Self::default()
        }
    }

    pub fn command(mut self, cmd: impl Into<String>) -> Self {
        self.command = Some(cmd.into());
        self
    }

    pub fn cores(mut self, cores: u32) -> Self {
        self.resources.cores = cores;
        self
    }

    pub fn mem_mb(mut self, mem: u64) -> Self {
        self.resources.mem_mb = Some(mem);
        self
    }

    pub fn time_min(mut self, minutes: u64) -> Self {
        self.resources.time_min = Some(minutes);
        self
    }

    pub fn must_succeed(mut self, val: bool) -> Self {
        self.must_succeed = Some(val);
        self
    }

    pub fn drm(mut self, name: impl Into<String>) -> Self {
        self.drm = Some(name.into());
        self
    }

    pub fn drm_options(mut self, opts: impl Into<String>) -> Self {
        self.drm_options = Some(opts.into());
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn parent(mut self, id: TaskId) -> Self {
        self.parents.push(id);
        self
    }

    pub fn parents(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.parents.extend(ids);
        self
    }

    pub fn uid(&self) -> String {
        tags_uid(&self.tags)
    }
}
