// src/engine/report.rs

//! Failure reports: one block per terminally failed task with everything
//! needed to find the root cause.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::model::{TaskId, Workflow};
use crate::types::TaskStatus;

/// Lines kept from the end of stdout and stderr.
pub const TAIL_LINES: usize = 40;

#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub stage: String,
    pub uid: String,
    pub attempt: u32,
    pub drm: String,
    pub job_id: Option<String>,
    pub exit_status: Option<i32>,
    pub reason: Option<String>,
    pub command: Option<String>,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

/// Last `n` lines of a file, or an empty string if it cannot be read.
pub fn tail(path: &Path, n: usize) -> String {
    let Ok(contents) = fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

impl FailureReport {
    /// Build the report for `id` if it failed for good.
    pub fn collect(wf: &Workflow, id: TaskId) -> Option<Self> {
        let task = wf.task(id)?;
        if task.status != TaskStatus::Failed {
            return None;
        }
        let stage = wf.stage_name_of(id).to_string();
        let paths = task.paths(&wf.settings.log_dir, &stage);
        let command = fs::read_to_string(&paths.command).ok().or_else(|| task.command.clone());
        let usage = task.usage.as_ref();

        Some(Self {
            uid: task.uid.clone(),
            attempt: task.attempt,
            drm: task.drm.clone(),
            job_id: task.drm_job_id.clone(),
            exit_status: usage.and_then(|u| u.exit_status),
            reason: usage.and_then(|u| u.status_reason.clone()),
            command,
            stdout_tail: tail(&paths.stdout, TAIL_LINES),
            stderr_tail: tail(&paths.stderr, TAIL_LINES),
            stage,
        })
    }
}

fn section(f: &mut fmt::Formatter<'_>, title: &str, body: &str) -> fmt::Result {
    writeln!(f, "--- {title} ---")?;
    if body.trim().is_empty() {
        writeln!(f, "(empty)")
    } else {
        writeln!(f, "{}", body.trim_end())
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "task {}/{} failed (attempt {}, drm {}, job {})",
            self.stage,
            self.uid,
            self.attempt,
            self.drm,
            self.job_id.as_deref().unwrap_or("-")
        )?;
        match self.exit_status {
            Some(code) => writeln!(f, "exit status: {code}")?,
            None => writeln!(f, "exit status: unknown")?,
        }
        if let Some(reason) = &self.reason {
            writeln!(f, "reason: {reason}")?;
        }
        section(f, "command", self.command.as_deref().unwrap_or(""))?;
        section(f, "stdout (tail)", &self.stdout_tail)?;
        section(f, "stderr (tail)", &self.stderr_tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::script::materialize;
    use crate::drm::usage::ResourceUsage;
    use crate::model::{TaskSpec, WorkflowSettings};
    use crate::types::tags;

    #[test]
    fn tail_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("out.txt");
        fs::write(&p, "1\n2\n3\n4\n").unwrap();
        assert_eq!(tail(&p, 2), "3\n4");
        assert_eq!(tail(&dir.path().join("missing"), 2), "");
    }

    #[test]
    fn report_gathers_command_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut wf = Workflow::new(
            "w",
            WorkflowSettings {
                log_dir: dir.path().to_path_buf(),
                ..WorkflowSettings::default()
            },
        );
        let s = wf.add_stage("align", &[]).unwrap();
        let id = wf
            .add_task(s, TaskSpec::new(tags([("s", "a")])).command("exit 2"))
            .unwrap();

        let paths = wf.task(id).unwrap().paths(dir.path(), "align");
        materialize(&paths, "exit 2").unwrap();
        fs::write(&paths.stderr, "boom\n").unwrap();

        assert!(FailureReport::collect(&wf, id).is_none());

        let task = wf.task_mut(id).unwrap();
        task.status = TaskStatus::Failed;
        task.usage = Some(ResourceUsage::with_exit_status(2));

        let report = FailureReport::collect(&wf, id).unwrap();
        assert_eq!(report.exit_status, Some(2));
        assert_eq!(report.stderr_tail, "boom");
        let text = report.to_string();
        assert!(text.contains("task align/s=a failed"));
        assert!(text.contains("exit 2"));
        assert!(text.contains("--- stdout (tail) ---\n(empty)"));
    }
}
