// src/model/workflow.rs

//! The workflow arena: owns every stage and task.
//!
//! Ownership is strictly top-down (workflow → stages → tasks). Parent/child
//! edges are id lists resolved through this arena, never owning pointers.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{FlowError, Result};
use crate::model::ids::{StageId, TaskId};
use crate::model::stage::Stage;
use crate::model::task::{Task, TaskSpec};
use crate::types::{StageStatus, TaskStatus, WorkflowStatus, format_tags, tags_uid};

/// Workflow-level policy shared by every task unless overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Global core budget; `None` means unlimited.
    pub max_cores: Option<u32>,
    pub max_attempts: u32,
    pub default_drm: String,
    pub log_dir: PathBuf,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_cores: None,
            max_attempts: 1,
            default_drm: "local".to_string(),
            log_dir: PathBuf::from("drmflow_out"),
        }
    }
}

/// What a resume pass removed from a persisted graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeSummary {
    pub deleted_tasks: usize,
    pub deleted_stages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub settings: WorkflowSettings,
    pub status: WorkflowStatus,
    pub started_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    stages: BTreeMap<StageId, Stage>,
    tasks: BTreeMap<TaskId, Task>,
    next_stage_id: u64,
    next_task_id: u64,
    /// Stage names declared during the current run; a second declaration is
    /// a name collision.
    #[serde(skip)]
    declared_stages: HashSet<String>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, settings: WorkflowSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            status: WorkflowStatus::NoAttempt,
            started_on: None,
            finished_on: None,
            stages: BTreeMap::new(),
            tasks: BTreeMap::new(),
            next_stage_id: 1,
            next_task_id: 1,
            declared_stages: HashSet::new(),
        }
    }

    // ----- lookups -------------------------------------------------------

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn task_or_err(&self, id: TaskId) -> Result<&Task> {
        self.tasks
            .get(&id)
            .ok_or_else(|| FlowError::TaskNotFound(id.to_string()))
    }

    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.get(&id)
    }

    pub fn stage_mut(&mut self, id: StageId) -> Option<&mut Stage> {
        self.stages.get_mut(&id)
    }

    pub fn stage_or_err(&self, id: StageId) -> Result<&Stage> {
        self.stages
            .get(&id)
            .ok_or_else(|| FlowError::StageNotFound(id.to_string()))
    }

    pub fn stage_id(&self, name: &str) -> Option<StageId> {
        self.stages
            .values()
            .find(|s| s.name == name)
            .map(|s| s.id)
    }

    pub fn stage_by_name(&self, name: &str) -> Option<&Stage> {
        self.stage_id(name).and_then(|id| self.stages.get(&id))
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.values()
    }

    pub fn stage_tasks(&self, stage: StageId) -> Vec<&Task> {
        self.stages
            .get(&stage)
            .map(|s| s.tasks.iter().filter_map(|t| self.tasks.get(t)).collect())
            .unwrap_or_default()
    }

    /// Name of the stage owning `task`, or an empty string for unknown ids.
    pub fn stage_name_of(&self, task: TaskId) -> &str {
        self.tasks
            .get(&task)
            .and_then(|t| self.stages.get(&t.stage))
            .map(|s| s.name.as_str())
            .unwrap_or("")
    }

    pub fn task_by_uid(&self, stage: &str, uid: &str) -> Option<&Task> {
        let stage = self.stage_by_name(stage)?;
        stage
            .tasks
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .find(|t| t.uid == uid)
    }

    // ----- graph construction -------------------------------------------

    /// Declare a stage for this run.
    ///
    /// A stage that survived a resume is reused under its old id; declaring
    /// the same name twice within one run is a [`FlowError::DuplicateStage`].
    pub fn add_stage(&mut self, name: &str, parents: &[StageId]) -> Result<StageId> {
        if self.declared_stages.contains(name) {
            return Err(FlowError::DuplicateStage(name.to_string()));
        }
        for parent in parents {
            self.stage_or_err(*parent)?;
        }

        let id = match self.stage_id(name) {
            Some(existing) => {
                debug!(stage = %name, "reusing persisted stage");
                existing
            }
            None => {
                let id = StageId(self.next_stage_id);
                self.next_stage_id += 1;
                self.stages.insert(id, Stage::new(id, name));
                debug!(stage = %name, %id, "created stage");
                id
            }
        };

        self.declared_stages.insert(name.to_string());
        for parent in parents {
            self.link_stages(*parent, id);
        }
        Ok(id)
    }

    /// Add a task to `stage`, deduplicating on its tag set.
    ///
    /// - identical tags to a successful task: that task is returned unchanged
    /// - identical tags to any other task: [`FlowError::DuplicateTags`]
    /// - different tags rendering to the same uid: [`FlowError::ConfigError`]
    pub fn add_task(&mut self, stage: StageId, spec: TaskSpec) -> Result<TaskId> {
        let stage_name = self.stage_or_err(stage)?.name.clone();
        if let Some(existing) = self.placement(Some(stage), &stage_name, &spec, &[])? {
            debug!(stage = %stage_name, task = %spec.uid(), "task already successful; reusing");
            return Ok(existing);
        }

        let mut parents: Vec<TaskId> = Vec::with_capacity(spec.parents.len());
        for parent in spec.parents {
            self.task_or_err(parent)?;
            if !parents.contains(&parent) {
                parents.push(parent);
            }
        }

        let id = TaskId(self.next_task_id);
        self.next_task_id += 1;

        let task = Task {
            id,
            stage,
            uid: tags_uid(&spec.tags),
            tags: spec.tags,
            command: spec.command,
            resources: spec.resources,
            status: TaskStatus::NoAttempt,
            attempt: 1,
            max_attempts: spec.max_attempts.unwrap_or(self.settings.max_attempts).max(1),
            must_succeed: spec.must_succeed.unwrap_or(true),
            drm: spec
                .drm
                .unwrap_or_else(|| self.settings.default_drm.clone()),
            drm_options: spec.drm_options,
            drm_job_id: None,
            usage: None,
            parents: parents.clone(),
            children: Vec::new(),
            started_on: None,
            submitted_on: None,
            finished_on: None,
        };
        self.tasks.insert(id, task);

        if let Some(s) = self.stages.get_mut(&stage) {
            s.tasks.push(id);
            // New work in a finished stage reopens it.
            if s.status == StageStatus::Successful {
                s.status = StageStatus::NoAttempt;
                s.finished_on = None;
            }
        }

        for parent in parents {
            let parent_stage = match self.tasks.get_mut(&parent) {
                Some(p) => {
                    p.children.push(id);
                    p.stage
                }
                None => continue,
            };
            if parent_stage != stage {
                self.link_stages(parent_stage, stage);
            }
        }

        Ok(id)
    }

    /// Check a whole batch of tasks for `stage_name` before anything is
    /// inserted, so a failing declaration leaves the arena untouched.
    pub(crate) fn check_batch(&self, stage_name: &str, specs: &[TaskSpec]) -> Result<()> {
        if self.declared_stages.contains(stage_name) {
            return Err(FlowError::DuplicateStage(stage_name.to_string()));
        }
        let stage = self.stage_id(stage_name);
        for (i, spec) in specs.iter().enumerate() {
            for parent in &spec.parents {
                self.task_or_err(*parent)?;
            }
            self.placement(stage, stage_name, spec, &specs[..i])?;
        }
        Ok(())
    }

    /// Where `spec` lands among the tasks of `stage` plus the `pending`
    /// specs of the same batch: `Some(id)` to reuse a successful task,
    /// `None` for a new one.
    fn placement(
        &self,
        stage: Option<StageId>,
        stage_name: &str,
        spec: &TaskSpec,
        pending: &[TaskSpec],
    ) -> Result<Option<TaskId>> {
        let uid = spec.uid();
        let existing = stage
            .map(|s| self.stage_tasks(s))
            .unwrap_or_default()
            .into_iter()
            .map(|t| (&t.tags, t.uid.clone(), Some((t.id, t.status))));
        let batch = pending.iter().map(|p| (&p.tags, p.uid(), None));

        for (tags, other_uid, persisted) in existing.chain(batch) {
            if *tags == spec.tags {
                return match persisted {
                    Some((id, TaskStatus::Successful)) => Ok(Some(id)),
                    _ => Err(FlowError::DuplicateTags {
                        stage: stage_name.to_string(),
                        tags: format_tags(&spec.tags),
                    }),
                };
            }
            if other_uid == uid {
                return Err(FlowError::ConfigError(format!(
                    "stage '{stage_name}': tag sets {} and {} both map to task uid '{uid}'",
                    format_tags(tags),
                    format_tags(&spec.tags)
                )));
            }
        }
        Ok(None)
    }

    fn link_stages(&mut self, parent: StageId, child: StageId) {
        if let Some(p) = self.stages.get_mut(&parent) {
            if !p.children.contains(&child) {
                p.children.push(child);
            }
        }
        if let Some(c) = self.stages.get_mut(&child) {
            if !c.parents.contains(&parent) {
                c.parents.push(parent);
            }
        }
    }

    /// Recompute stage numbers from a topological sort of the stage graph.
    ///
    /// Nodes and edges are inserted in id order so ties resolve the same way
    /// on every run.
    pub fn number_stages(&mut self) -> Result<()> {
        let mut graph: DiGraphMap<StageId, ()> = DiGraphMap::new();
        for id in self.stages.keys() {
            graph.add_node(*id);
        }
        for stage in self.stages.values() {
            for child in &stage.children {
                graph.add_edge(stage.id, *child, ());
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            let name = self
                .stages
                .get(&cycle.node_id())
                .map(|s| s.name.clone())
                .unwrap_or_default();
            FlowError::DagCycle(format!("cycle detected involving stage '{name}'"))
        })?;

        for (idx, id) in order.into_iter().enumerate() {
            if let Some(stage) = self.stages.get_mut(&id) {
                stage.number = idx as u32 + 1;
            }
        }
        Ok(())
    }

    // ----- resume --------------------------------------------------------

    /// Forget which stages were declared, so the graph can be declared again
    /// by the next run.
    pub fn begin_declarations(&mut self) {
        self.declared_stages.clear();
    }

    /// Drop everything that has not succeeded so that expansion regenerates
    /// it: every non-successful task, then every stage left without tasks.
    pub fn prepare_resume(&mut self) -> ResumeSummary {
        let doomed: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status != TaskStatus::Successful)
            .map(|t| t.id)
            .collect();
        for id in &doomed {
            self.delete_task(*id);
        }

        let empty: Vec<StageId> = self
            .stages
            .values()
            .filter(|s| s.tasks.is_empty())
            .map(|s| s.id)
            .collect();
        for id in &empty {
            self.delete_stage(*id);
        }

        // Only successful tasks remain, so every surviving stage is too.
        for stage in self.stages.values_mut() {
            stage.status = StageStatus::Successful;
        }

        self.status = WorkflowStatus::NoAttempt;
        self.finished_on = None;
        self.begin_declarations();

        let summary = ResumeSummary {
            deleted_tasks: doomed.len(),
            deleted_stages: empty.len(),
        };
        info!(
            workflow = %self.name,
            deleted_tasks = summary.deleted_tasks,
            deleted_stages = summary.deleted_stages,
            "prepared workflow for resume"
        );
        summary
    }

    fn delete_task(&mut self, id: TaskId) {
        let Some(task) = self.tasks.remove(&id) else {
            return;
        };
        if let Some(stage) = self.stages.get_mut(&task.stage) {
            stage.tasks.retain(|t| *t != id);
        }
        for parent in &task.parents {
            if let Some(p) = self.tasks.get_mut(parent) {
                p.children.retain(|c| *c != id);
            }
        }
        for child in &task.children {
            if let Some(c) = self.tasks.get_mut(child) {
                c.parents.retain(|p| *p != id);
            }
        }
    }

    fn delete_stage(&mut self, id: StageId) {
        let Some(stage) = self.stages.remove(&id) else {
            return;
        };
        for task in &stage.tasks {
            self.delete_task(*task);
        }
        for other in self.stages.values_mut() {
            other.parents.retain(|p| *p != id);
            other.children.retain(|c| *c != id);
        }
    }
}
