// src/config/build.rs

//! Turn a validated [`WorkflowFile`] into the things a run needs: workflow
//! settings, a DRM registry and the declared stages.

use std::time::Duration;

use tracing::debug;

use crate::config::model::{StageConfig, WorkflowFile};
use crate::drm::{DrmRegistry, build_drm};
use crate::engine::RunOptions;
use crate::errors::{FlowError, Result};
use crate::graph::{RelationshipPattern, SplitSpace, StageTemplate};
use crate::model::{Resources, StageId, Workflow, WorkflowSettings};
use crate::types::{PatternKind, Tags};

pub fn workflow_settings(file: &WorkflowFile) -> WorkflowSettings {
    WorkflowSettings {
        max_cores: file.workflow.max_cores,
        max_attempts: file.workflow.max_attempts,
        default_drm: file.workflow.default_drm.clone(),
        log_dir: file.workflow.log_dir.clone(),
    }
}

pub fn run_options(file: &WorkflowFile) -> RunOptions {
    RunOptions::default().poll_interval(Duration::from_millis(file.workflow.poll_interval_ms))
}

/// Adapters for every backend the file's stages submit to.
pub fn build_registry(file: &WorkflowFile) -> Result<DrmRegistry> {
    let mut registry = DrmRegistry::new();
    for name in file.drms_in_use() {
        let settings = file.drm.get(&name).cloned().unwrap_or_default();
        registry.register(build_drm(&name, &settings)?);
        debug!(drm = %name, "registered backend");
    }
    Ok(registry)
}

fn stage_template(stage: &StageConfig) -> StageTemplate {
    StageTemplate {
        command: stage.cmd.clone(),
        resources: Resources {
            cores: stage.cores,
            mem_mb: stage.mem_mb,
            time_min: stage.time_req_min,
        },
        must_succeed: stage.must_succeed,
        drm: stage.drm.clone(),
        drm_options: stage.drm_options.clone(),
        max_attempts: stage.max_attempts,
    }
}

fn stage_pattern(stage: &StageConfig, kind: PatternKind) -> RelationshipPattern {
    let split = || SplitSpace::product(stage.split_by.iter().map(|(k, v)| (k.clone(), v.clone())));
    match kind {
        PatternKind::OneToOne => RelationshipPattern::OneToOne,
        PatternKind::ManyToOne => RelationshipPattern::many_to_one(stage.reduce_by.iter().cloned()),
        PatternKind::OneToMany => RelationshipPattern::one_to_many(split()),
        PatternKind::ManyToMany => RelationshipPattern::many_to_many(stage.reduce_by.iter().cloned(), split()),
    }
}

/// Declare every stage of `file` on `wf`, parents first.
///
/// On a resumed workflow, successful tasks are matched by tag set and kept;
/// everything else is expanded again.
pub fn declare_stages(wf: &mut Workflow, file: &WorkflowFile) -> Result<()> {
    wf.begin_declarations();
    for stage in &file.stages {
        let parents: Vec<StageId> = stage
            .parents
            .iter()
            .map(|p| wf.stage_id(p).ok_or_else(|| FlowError::StageNotFound(p.clone())))
            .collect::<Result<_>>()?;
        let template = stage_template(stage);

        match stage.effective_pattern() {
            Some(kind) => {
                let pattern = stage_pattern(stage, kind);
                wf.add_stage_from_pattern(&stage.name, &parents, &pattern, &stage.tags, &template)?;
            }
            None => {
                let tasks = if stage.tasks.is_empty() {
                    vec![Tags::new()]
                } else {
                    stage.tasks.clone()
                };
                wf.add_stage_with_tasks(&stage.name, &parents, &tasks, &stage.tags, &template)?;
            }
        }
    }
    wf.number_stages()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::RawWorkflowFile;
    use crate::types::TagValue;

    const SRC: &str = r#"
        [workflow]
        name = "calls"
        max_cores = 8
        max_attempts = 2

        [[stage]]
        name = "align"
        cmd = "align {sample}"
        tasks = [ { sample = "a", lane = 1 }, { sample = "a", lane = 2 }, { sample = "b", lane = 1 } ]
        cores = 2

        [[stage]]
        name = "merge"
        parents = ["align"]
        pattern = "many_to_one"
        reduce_by = ["sample"]
        cmd = "merge {sample}"

        [[stage]]
        name = "shard"
        parents = ["merge"]
        pattern = "one_to_many"
        split_by = { chunk = [1, 2, 3] }
        cmd = "shard {sample} {chunk}"
        must_succeed = false

        [[stage]]
        name = "summary"
        parents = ["shard"]
        pattern = "many_to_one"
    "#;

    fn file() -> WorkflowFile {
        let raw: RawWorkflowFile = toml::from_str(SRC).unwrap();
        WorkflowFile::try_from(raw).unwrap()
    }

    #[test]
    fn declares_expanded_graph() {
        let file = file();
        let mut wf = Workflow::new("calls", workflow_settings(&file));
        declare_stages(&mut wf, &file).unwrap();

        let count = |name: &str| wf.stage_tasks(wf.stage_id(name).unwrap()).len();
        assert_eq!(count("align"), 3);
        assert_eq!(count("merge"), 2);
        assert_eq!(count("shard"), 6);
        assert_eq!(count("summary"), 1);

        let shard = wf.task_by_uid("shard", "chunk=2__sample=b").unwrap();
        assert_eq!(shard.command.as_deref(), Some("shard b 2"));
        assert!(!shard.must_succeed);
        assert_eq!(shard.max_attempts, 2);

        let summary = wf.task_by_uid("summary", "default").unwrap();
        assert!(summary.is_noop());
        assert_eq!(summary.parents.len(), 6);

        let merge_a = wf.task_by_uid("merge", "sample=a").unwrap();
        assert_eq!(merge_a.tag("sample"), Some(&TagValue::from("a")));
        assert_eq!(merge_a.parents.len(), 2);
    }

    #[test]
    fn registry_covers_stages_with_commands() {
        let registry = build_registry(&file()).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["local"]);
    }
}
