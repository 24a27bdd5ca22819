use std::collections::BTreeMap;
use std::path::Path;

use drmflow::config::{RawWorkflowFile, StageConfig, WorkflowFile, WorkflowSection};
use drmflow::drm::DrmSettings;
use drmflow::types::{PatternKind, TagValue, Tags};

/// Builder for `WorkflowFile` to simplify test setup.
pub struct WorkflowFileBuilder {
    raw: RawWorkflowFile,
}

impl WorkflowFileBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            raw: RawWorkflowFile {
                workflow: WorkflowSection {
                    name: name.to_string(),
                    max_cores: None,
                    max_attempts: 1,
                    default_drm: "local".to_string(),
                    log_dir: "drmflow_out".into(),
                    poll_interval_ms: 5,
                },
                drm: BTreeMap::new(),
                stage: Vec::new(),
            },
        }
    }

    pub fn max_cores(mut self, cores: u32) -> Self {
        self.raw.workflow.max_cores = Some(cores);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.raw.workflow.max_attempts = n;
        self
    }

    pub fn default_drm(mut self, name: &str) -> Self {
        self.raw.workflow.default_drm = name.to_string();
        self
    }

    pub fn log_dir(mut self, dir: &Path) -> Self {
        self.raw.workflow.log_dir = dir.to_path_buf();
        self
    }

    pub fn drm(mut self, name: &str, settings: DrmSettings) -> Self {
        self.raw.drm.insert(name.to_string(), settings);
        self
    }

    pub fn stage(mut self, stage: StageConfig) -> Self {
        self.raw.stage.push(stage);
        self
    }

    pub fn raw(self) -> RawWorkflowFile {
        self.raw
    }

    pub fn build(self) -> WorkflowFile {
        WorkflowFile::try_from(self.raw).expect("Failed to build valid workflow file from builder")
    }
}

/// Builder for `StageConfig`.
pub struct StageConfigBuilder {
    stage: StageConfig,
}

impl StageConfigBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            stage: StageConfig {
                name: name.to_string(),
                parents: vec![],
                pattern: None,
                reduce_by: vec![],
                split_by: BTreeMap::new(),
                tags: Tags::new(),
                tasks: vec![],
                cmd: None,
                cores: 1,
                mem_mb: None,
                time_req_min: None,
                drm: None,
                drm_options: None,
                must_succeed: None,
                max_attempts: None,
            },
        }
    }

    pub fn cmd(mut self, cmd: &str) -> Self {
        self.stage.cmd = Some(cmd.to_string());
        self
    }

    pub fn parent(mut self, name: &str) -> Self {
        self.stage.parents.push(name.to_string());
        self
    }

    pub fn pattern(mut self, kind: PatternKind) -> Self {
        self.stage.pattern = Some(kind);
        self
    }

    pub fn reduce_by(mut self, key: &str) -> Self {
        self.stage.reduce_by.push(key.to_string());
        self
    }

    pub fn split_by<V: Into<TagValue>>(mut self, key: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.stage
            .split_by
            .insert(key.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn task(mut self, tags: Tags) -> Self {
        self.stage.tasks.push(tags);
        self
    }

    pub fn tag(mut self, key: &str, value: impl Into<TagValue>) -> Self {
        self.stage.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn cores(mut self, cores: u32) -> Self {
        self.stage.cores = cores;
        self
    }

    pub fn drm(mut self, name: &str) -> Self {
        self.stage.drm = Some(name.to_string());
        self
    }

    pub fn must_succeed(mut self, val: bool) -> Self {
        self.stage.must_succeed = Some(val);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.stage.max_attempts = Some(n);
        self
    }

    pub fn build(self) -> StageConfig {
        self.stage
    }
}
