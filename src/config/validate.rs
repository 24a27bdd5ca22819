// src/config/validate.rs

use std::collections::{BTreeMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use regex::Regex;

use crate::config::model::{RawWorkflowFile, StageConfig, WorkflowFile};
use crate::drm::KNOWN_DRMS;
use crate::errors::{FlowError, Result};
use crate::types::PatternKind;

/// Stage names end up in log paths and job names.
const STAGE_NAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]*$";

impl TryFrom<RawWorkflowFile> for WorkflowFile {
    type Error = FlowError;

    fn try_from(raw: RawWorkflowFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_workflow(&raw)?;
        let order: Vec<String> = stage_order(&raw.stage)?
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut by_name: BTreeMap<String, StageConfig> = raw
            .stage
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        let stages = order
            .iter()
            .filter_map(|name| by_name.remove(name.as_str()))
            .collect();

        Ok(WorkflowFile::new_unchecked(raw.workflow, raw.drm, stages))
    }
}

fn validate_raw_workflow(cfg: &RawWorkflowFile) -> Result<()> {
    ensure_has_stages(cfg)?;
    validate_workflow_section(cfg)?;
    validate_stage_names(cfg)?;
    validate_stage_parents(cfg)?;
    for stage in &cfg.stage {
        validate_pattern(stage)?;
        validate_resources(cfg, stage)?;
    }
    validate_drms(cfg)?;
    Ok(())
}

fn config_err(msg: impl Into<String>) -> FlowError {
    FlowError::ConfigError(msg.into())
}

fn ensure_has_stages(cfg: &RawWorkflowFile) -> Result<()> {
    if cfg.stage.is_empty() {
        return Err(config_err("workflow must contain at least one [[stage]] entry"));
    }
    Ok(())
}

fn validate_workflow_section(cfg: &RawWorkflowFile) -> Result<()> {
    let wf = &cfg.workflow;
    if wf.name.trim().is_empty() {
        return Err(config_err("[workflow].name must not be empty"));
    }
    if wf.max_attempts == 0 {
        return Err(config_err("[workflow].max_attempts must be >= 1 (got 0)"));
    }
    if wf.max_cores == Some(0) {
        return Err(config_err("[workflow].max_cores must be >= 1 when set"));
    }
    if wf.poll_interval_ms == 0 {
        return Err(config_err("[workflow].poll_interval_ms must be >= 1"));
    }
    Ok(())
}

fn validate_stage_names(cfg: &RawWorkflowFile) -> Result<()> {
    let re = Regex::new(STAGE_NAME_PATTERN).map_err(|e| config_err(e.to_string()))?;
    let mut seen = HashSet::new();
    for stage in &cfg.stage {
        if !re.is_match(&stage.name) {
            return Err(config_err(format!(
                "invalid stage name '{}': use letters, digits, '.', '_' or '-'",
                stage.name
            )));
        }
        if !seen.insert(stage.name.as_str()) {
            return Err(FlowError::DuplicateStage(stage.name.clone()));
        }
    }
    Ok(())
}

fn validate_stage_parents(cfg: &RawWorkflowFile) -> Result<()> {
    let names: HashSet<&str> = cfg.stage.iter().map(|s| s.name.as_str()).collect();
    for stage in &cfg.stage {
        for parent in &stage.parents {
            if parent == &stage.name {
                return Err(config_err(format!(
                    "stage '{}' cannot be its own parent",
                    stage.name
                )));
            }
            if !names.contains(parent.as_str()) {
                return Err(config_err(format!(
                    "stage '{}' has unknown parent '{}'",
                    stage.name, parent
                )));
            }
        }
    }
    Ok(())
}

fn validate_pattern(stage: &StageConfig) -> Result<()> {
    let name = &stage.name;

    if stage.parents.is_empty() && stage.pattern.is_some() {
        return Err(config_err(format!(
            "stage '{name}' sets `pattern` but has no parents"
        )));
    }
    if !stage.tasks.is_empty() && stage.pattern.is_some() {
        return Err(config_err(format!(
            "stage '{name}' sets both `tasks` and `pattern`"
        )));
    }

    let pattern = stage.effective_pattern();
    let reduces = matches!(pattern, Some(PatternKind::ManyToOne | PatternKind::ManyToMany));
    let splits = matches!(pattern, Some(PatternKind::OneToMany | PatternKind::ManyToMany));

    if !reduces && !stage.reduce_by.is_empty() {
        return Err(config_err(format!(
            "stage '{name}': `reduce_by` needs pattern many_to_one or many_to_many"
        )));
    }
    if !splits && !stage.split_by.is_empty() {
        return Err(config_err(format!(
            "stage '{name}': `split_by` needs pattern one_to_many or many_to_many"
        )));
    }
    if splits && stage.split_by.is_empty() {
        return Err(config_err(format!(
            "stage '{name}': pattern {} needs a non-empty `split_by`",
            if pattern == Some(PatternKind::OneToMany) { "one_to_many" } else { "many_to_many" }
        )));
    }
    if let Some((key, _)) = stage.split_by.iter().find(|(_, values)| values.is_empty()) {
        return Err(config_err(format!(
            "stage '{name}': split_by key '{key}' has no values"
        )));
    }
    let mut keys = HashSet::new();
    if let Some(dup) = stage.reduce_by.iter().find(|k| !keys.insert(k.as_str())) {
        return Err(config_err(format!(
            "stage '{name}': reduce_by key '{dup}' listed twice"
        )));
    }
    Ok(())
}

fn validate_resources(cfg: &RawWorkflowFile, stage: &StageConfig) -> Result<()> {
    if stage.max_attempts == Some(0) {
        return Err(config_err(format!(
            "stage '{}': max_attempts must be >= 1 (got 0)",
            stage.name
        )));
    }
    if stage.cores == 0 {
        return Err(config_err(format!("stage '{}': cores must be >= 1", stage.name)));
    }
    if let Some(budget) = cfg.workflow.max_cores {
        if stage.cmd.is_some() && stage.cores > budget {
            return Err(FlowError::ResourceExceedsBudget {
                task: stage.name.clone(),
                requested: stage.cores,
                budget,
            });
        }
    }
    Ok(())
}

fn validate_drms(cfg: &RawWorkflowFile) -> Result<()> {
    let known = |name: &str| KNOWN_DRMS.contains(&name);

    if !known(&cfg.workflow.default_drm) {
        return Err(FlowError::UnsupportedDrm(cfg.workflow.default_drm.clone()));
    }
    for name in cfg.drm.keys() {
        if !known(name) {
            return Err(FlowError::UnsupportedDrm(name.clone()));
        }
    }
    for stage in &cfg.stage {
        if let Some(drm) = &stage.drm {
            if !known(drm) {
                return Err(FlowError::UnsupportedDrm(drm.clone()));
            }
        }
    }

    let uses_batch = cfg
        .stage
        .iter()
        .filter(|s| s.cmd.is_some())
        .any(|s| s.drm.as_deref().unwrap_or(&cfg.workflow.default_drm) == "awsbatch");
    if uses_batch {
        let complete = cfg
            .drm
            .get("awsbatch")
            .is_some_and(|s| s.job_queue.is_some() && s.image.is_some());
        if !complete {
            return Err(config_err(
                "[drm.awsbatch] needs `job_queue` and `image` when a stage submits to awsbatch",
            ));
        }
    }
    Ok(())
}

/// Topological order of stage names; ties keep declaration order.
fn stage_order(stages: &[StageConfig]) -> Result<Vec<&str>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for stage in stages {
        graph.add_node(stage.name.as_str());
    }
    for stage in stages {
        for parent in &stage.parents {
            graph.add_edge(parent.as_str(), stage.name.as_str(), ());
        }
    }

    if let Err(cycle) = toposort(&graph, None) {
        return Err(FlowError::DagCycle(format!(
            "cycle detected in stage graph involving stage '{}'",
            cycle.node_id()
        )));
    }

    // Acyclic: repeatedly take the first declared stage whose parents are
    // all placed.
    let mut placed: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(stages.len());
    while order.len() < stages.len() {
        let next = stages
            .iter()
            .find(|s| {
                !placed.contains(s.name.as_str())
                    && s.parents.iter().all(|p| placed.contains(p.as_str()))
            })
            .ok_or_else(|| FlowError::DagCycle("stage graph could not be ordered".into()))?;
        placed.insert(next.name.as_str());
        order.push(next.name.as_str());
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<WorkflowFile> {
        let raw: RawWorkflowFile = toml::from_str(toml_src)?;
        WorkflowFile::try_from(raw)
    }

    #[test]
    fn stages_are_ordered_after_their_parents() {
        let wf = parse(
            r#"
            [workflow]
            name = "w"

            [[stage]]
            name = "b"
            parents = ["a"]

            [[stage]]
            name = "a"
            "#,
        )
        .unwrap();
        let names: Vec<_> = wf.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let err = parse(
            r#"
            [workflow]
            name = "w"

            [[stage]]
            name = "a"
            parents = ["b"]

            [[stage]]
            name = "b"
            parents = ["a"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::DagCycle(_)));
    }

    #[test]
    fn split_without_pattern_is_rejected() {
        let err = parse(
            r#"
            [workflow]
            name = "w"

            [[stage]]
            name = "a"

            [[stage]]
            name = "b"
            parents = ["a"]
            split_by = { chunk = [1, 2] }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("split_by"));
    }

    #[test]
    fn unknown_drm_and_budget_are_checked() {
        let err = parse(
            r#"
            [workflow]
            name = "w"

            [[stage]]
            name = "a"
            cmd = "true"
            drm = "pbs"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::UnsupportedDrm(name) if name == "pbs"));

        let err = parse(
            r#"
            [workflow]
            name = "w"
            max_cores = 2

            [[stage]]
            name = "a"
            cmd = "true"
            cores = 4
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::ResourceExceedsBudget { requested: 4, budget: 2, .. }));
    }

    #[test]
    fn awsbatch_needs_queue_and_image() {
        let err = parse(
            r#"
            [workflow]
            name = "w"
            default_drm = "awsbatch"

            [drm.awsbatch]
            job_queue = "q"

            [[stage]]
            name = "a"
            cmd = "true"
            "#,
        )
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn bad_stage_name_is_rejected() {
        let err = parse(
            r#"
            [workflow]
            name = "w"

            [[stage]]
            name = "has space"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid stage name"));
    }
}
