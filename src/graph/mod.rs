// src/graph/mod.rs

//! Graph expansion: stage declarations → concrete, tagged tasks.
//!
//! - [`pattern`] holds the closed set of relationship patterns.
//! - [`expand`] turns a pattern plus parent tasks into child specs (pure).
//! - [`template`] renders `{tag}` command templates.
//!
//! This module also adds the pattern-driven constructors to [`Workflow`].

pub mod expand;
pub mod pattern;
pub mod template;

pub use expand::{ChildSpec, Group, expand, reduce};
pub use pattern::{RelationshipPattern, SplitFn, SplitSpace};

use tracing::info;

use crate::errors::Result;
use crate::model::{Resources, StageId, TaskId, TaskSpec, Workflow};
use crate::types::{Tags, merge_tags};

/// Per-task settings shared by every task of a stage.
#[derive(Debug, Clone, Default)]
pub struct StageTemplate {
    /// Command template; `None` makes every task a no-op.
    pub command: Option<String>,
    pub resources: Resources,
    pub must_succeed: Option<bool>,
    pub drm: Option<String>,
    pub drm_options: Option<String>,
    pub max_attempts: Option<u32>,
}

impl StageTemplate {
    pub fn command(cmd: impl Into<String>) -> Self {
        Self {
            command: Some(cmd.into()),
            ..Self::default()
        }
    }

    /// Task spec for one child, with the command rendered from its tags.
    pub fn task_spec(&self, tags: Tags, parents: Vec<TaskId>) -> Result<TaskSpec> {
        let command = match &self.command {
            Some(t) => Some(template::render(t, &tags)?),
            None => None,
        };
        Ok(TaskSpec {
            tags,
            command,
            resources: self.resources,
            must_succeed: self.must_succeed,
            drm: self.drm.clone(),
            drm_options: self.drm_options.clone(),
            max_attempts: self.max_attempts,
            parents,
        })
    }
}

impl Workflow {
    /// Declare a root stage with one task per explicit tag set.
    ///
    /// Every task spec is built and checked before the stage is inserted,
    /// so an error leaves the workflow unchanged.
    pub fn add_stage_with_tasks(
        &mut self,
        name: &str,
        parents: &[StageId],
        task_tags: &[Tags],
        extra: &Tags,
        template: &StageTemplate,
    ) -> Result<StageId> {
        self.check_parent_stages(parents)?;
        let parent_tasks = self.parent_task_ids(parents);
        let specs = task_tags
            .iter()
            .map(|tags| template.task_spec(merge_tags(tags, extra), parent_tasks.clone()))
            .collect::<Result<Vec<_>>>()?;

        let stage = self.insert_stage(name, parents, specs)?;
        info!(stage = %name, tasks = task_tags.len(), "declared stage");
        Ok(stage)
    }

    /// Declare a stage whose tasks are derived from its parents' tasks.
    pub fn add_stage_from_pattern(
        &mut self,
        name: &str,
        parents: &[StageId],
        pattern: &RelationshipPattern,
        extra: &Tags,
        template: &StageTemplate,
    ) -> Result<StageId> {
        self.check_parent_stages(parents)?;
        let children = {
            let parent_tasks: Vec<(TaskId, &Tags)> = parents
                .iter()
                .flat_map(|p| self.stage_tasks(*p))
                .map(|t| (t.id, &t.tags))
                .collect();
            expand(&parent_tasks, pattern, extra, name)?
        };
        let specs = children
            .into_iter()
            .map(|child| template.task_spec(child.tags, child.parents))
            .collect::<Result<Vec<_>>>()?;

        let count = specs.len();
        let stage = self.insert_stage(name, parents, specs)?;
        info!(stage = %name, pattern = ?pattern.kind(), tasks = count, "declared stage");
        Ok(stage)
    }

    fn check_parent_stages(&self, parents: &[StageId]) -> Result<()> {
        for parent in parents {
            self.stage_or_err(*parent)?;
        }
        Ok(())
    }

    fn insert_stage(
        &mut self,
        name: &str,
        parents: &[StageId],
        specs: Vec<TaskSpec>,
    ) -> Result<StageId> {
        self.check_batch(name, &specs)?;
        let stage = self.add_stage(name, parents)?;
        for spec in specs {
            self.add_task(stage, spec)?;
        }
        Ok(stage)
    }

    fn parent_task_ids(&self, parents: &[StageId]) -> Vec<TaskId> {
        parents
            .iter()
            .flat_map(|p| self.stage_tasks(*p))
            .map(|t| t.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FlowError;
    use crate::model::WorkflowSettings;
    use crate::types::{TagValue, tags};

    #[test]
    fn pattern_stage_renders_commands_and_links_parents() {
        let mut wf = Workflow::new("w", WorkflowSettings::default());
        let align = wf
            .add_stage_with_tasks(
                "align",
                &[],
                &[tags([("s", "a"), ("l", "1")]), tags([("s", "a"), ("l", "2")])],
                &Tags::new(),
                &StageTemplate::command("align {s} {l}"),
            )
            .unwrap();
        let merge = wf
            .add_stage_from_pattern(
                "merge",
                &[align],
                &RelationshipPattern::many_to_one(["s"]),
                &tags([("kind", "bam")]),
                &StageTemplate::command("merge {s} > {s}.{kind}"),
            )
            .unwrap();

        let merged = wf.stage_tasks(merge);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].command.as_deref(), Some("merge a > a.bam"));
        assert_eq!(merged[0].parents.len(), 2);
        assert_eq!(wf.stage(merge).unwrap().parents, vec![align]);
    }

    #[test]
    fn unknown_placeholder_fails_expansion() {
        let mut wf = Workflow::new("w", WorkflowSettings::default());
        let err = wf
            .add_stage_with_tasks(
                "a",
                &[],
                &[tags([("x", TagValue::from(1))])],
                &Tags::new(),
                &StageTemplate::command("echo {y}"),
            )
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(matches!(err, FlowError::ConfigError(_)));
    }

    #[test]
    fn noop_template_has_no_command() {
        let mut wf = Workflow::new("w", WorkflowSettings::default());
        let s = wf
            .add_stage_with_tasks("g", &[], &[Tags::new()], &Tags::new(), &StageTemplate::default())
            .unwrap();
        assert!(wf.stage_tasks(s)[0].is_noop());
    }

    #[test]
    fn failing_render_leaves_no_half_declared_stage() {
        let mut wf = Workflow::new("w", WorkflowSettings::default());
        let err = wf
            .add_stage_with_tasks(
                "a",
                &[],
                &[tags([("x", "1"), ("y", "2")]), tags([("x", "2")])],
                &Tags::new(),
                &StageTemplate::command("echo {x} {y}"),
            )
            .unwrap_err();
        assert!(matches!(err, FlowError::ConfigError(_)));
        assert!(wf.stage_id("a").is_none());
        assert_eq!(wf.tasks().count(), 0);

        // The name is still free for a corrected declaration.
        wf.add_stage_with_tasks(
            "a",
            &[],
            &[tags([("x", "1"), ("y", "2")])],
            &Tags::new(),
            &StageTemplate::command("echo {x} {y}"),
        )
        .unwrap();
        assert_eq!(wf.tasks().count(), 1);
    }

    #[test]
    fn colliding_children_leave_no_half_declared_stage() {
        let mut wf = Workflow::new("w", WorkflowSettings::default());
        let src = wf
            .add_stage_with_tasks(
                "src",
                &[],
                &[tags([("x", 1)]), tags([("x", 2)])],
                &Tags::new(),
                &StageTemplate::default(),
            )
            .unwrap();
        let err = wf
            .add_stage_from_pattern(
                "flat",
                &[src],
                &RelationshipPattern::OneToOne,
                &tags([("x", 0)]),
                &StageTemplate::default(),
            )
            .unwrap_err();
        assert!(matches!(err, FlowError::DuplicateTags { .. }));
        assert!(wf.stage_id("flat").is_none());
        assert_eq!(wf.tasks().count(), 2);
        assert!(wf.stage(src).unwrap().children.is_empty());
    }
}
