// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::drm::DrmSettings;
use crate::types::{PatternKind, TagValue, Tags};

/// Workflow file as read from TOML, before validation.
///
/// ```toml
/// [workflow]
/// name = "variant-calling"
/// max_cores = 16
///
/// [drm.slurm]
/// native_spec = "-p short"
///
/// [[stage]]
/// name = "align"
/// cmd = "bwa mem {sample}.fq > {sample}.bam"
/// tasks = [ { sample = "a" }, { sample = "b" } ]
///
/// [[stage]]
/// name = "merge"
/// parents = ["align"]
/// pattern = "many_to_one"
/// reduce_by = []
/// cmd = "merge"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawWorkflowFile {
    pub workflow: WorkflowSection,

    /// Per-backend settings from `[drm.<name>]`.
    #[serde(default)]
    pub drm: BTreeMap<String, DrmSettings>,

    /// Stages from `[[stage]]`, in declaration order.
    #[serde(default)]
    pub stage: Vec<StageConfig>,
}

/// `[workflow]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowSection {
    pub name: String,

    /// Global core budget. Unlimited when absent.
    #[serde(default)]
    pub max_cores: Option<u32>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_drm")]
    pub default_drm: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_drm() -> String {
    "local".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("drmflow_out")
}

fn default_poll_interval_ms() -> u64 {
    500
}

/// One `[[stage]]` entry.
///
/// A stage without parents gets one task per entry of `tasks` (or a single
/// task when `tasks` is empty). A stage with parents derives its tasks
/// through `pattern` unless it lists `tasks` explicitly, in which case every
/// task depends on every task of the parent stages.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,

    #[serde(default)]
    pub parents: Vec<String>,

    /// Defaults to `one_to_one` for stages with parents.
    #[serde(default)]
    pub pattern: Option<PatternKind>,

    #[serde(default)]
    pub reduce_by: Vec<String>,

    /// Split space for `one_to_many` / `many_to_many`; keys vary in sorted
    /// order, first key slowest.
    #[serde(default)]
    pub split_by: BTreeMap<String, Vec<TagValue>>,

    /// Extra tags merged into every task of the stage.
    #[serde(default)]
    pub tags: Tags,

    #[serde(default)]
    pub tasks: Vec<Tags>,

    /// Command template with `{tag}` placeholders. Absent means no-op tasks.
    #[serde(default)]
    pub cmd: Option<String>,

    #[serde(default = "default_cores")]
    pub cores: u32,

    #[serde(default)]
    pub mem_mb: Option<u64>,

    #[serde(default)]
    pub time_req_min: Option<u64>,

    #[serde(default)]
    pub drm: Option<String>,

    #[serde(default)]
    pub drm_options: Option<String>,

    #[serde(default)]
    pub must_succeed: Option<bool>,

    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_cores() -> u32 {
    1
}

impl StageConfig {
    /// Pattern the stage expands with, if it derives tasks from parents.
    pub fn effective_pattern(&self) -> Option<PatternKind> {
        if self.parents.is_empty() || !self.tasks.is_empty() {
            None
        } else {
            Some(self.pattern.unwrap_or_default())
        }
    }
}

/// A workflow file that passed validation. Stages are in an order where
/// every stage follows its parents.
///
/// Only constructed through `TryFrom<RawWorkflowFile>`.
#[derive(Debug, Clone)]
pub struct WorkflowFile {
    pub workflow: WorkflowSection,
    pub drm: BTreeMap<String, DrmSettings>,
    pub stages: Vec<StageConfig>,
}

impl WorkflowFile {
    pub(crate) fn new_unchecked(
        workflow: WorkflowSection,
        drm: BTreeMap<String, DrmSettings>,
        stages: Vec<StageConfig>,
    ) -> Self {
        Self {
            workflow,
            drm,
            stages,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Backend name a stage's tasks are submitted to.
    pub fn stage_drm<'a>(&'a self, stage: &'a StageConfig) -> &'a str {
        stage.drm.as_deref().unwrap_or(&self.workflow.default_drm)
    }

    /// Every backend some stage with a command submits to, sorted.
    pub fn drms_in_use(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stages
            .iter()
            .filter(|s| s.cmd.is_some())
            .map(|s| self.stage_drm(s).to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
