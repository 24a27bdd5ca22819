// src/drm/script.rs

//! Command materialisation and the per-task log layout.
//!
//! Every attempt gets its own files under
//! `<log_dir>/<stage>/<uid>/`:
//!
//! - `command_attempt<N>.sh`
//! - `stdout_attempt<N>.txt`
//! - `stderr_attempt<N>.txt`
//! - `profile_attempt<N>.json` (written by an external resource sampler)

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::Result;

/// Preamble of every generated script: abort on the first failing command or
/// pipeline stage, and ignore the advisory signals the orchestrator handles
/// itself.
pub const SCRIPT_PREAMBLE: &str = "#!/bin/bash\nset -e\nset -o pipefail\ntrap \"\" USR1 USR2\n";

/// File locations for one attempt of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPaths {
    pub dir: PathBuf,
    pub command: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub profile: PathBuf,
}

impl TaskPaths {
    pub fn new(log_dir: &Path, stage: &str, uid: &str, attempt: u32) -> Self {
        let dir = log_dir.join(sanitize(stage)).join(sanitize(uid));
        Self {
            command: dir.join(format!("command_attempt{attempt}.sh")),
            stdout: dir.join(format!("stdout_attempt{attempt}.txt")),
            stderr: dir.join(format!("stderr_attempt{attempt}.txt")),
            profile: dir.join(format!("profile_attempt{attempt}.json")),
            dir,
        }
    }
}

/// Keep path components portable and distinct: bytes outside
/// `[A-Za-z0-9._=-]` are written as `%XX`, so two different uids never
/// share a directory. `.` and `..` are escaped whole and the empty
/// component becomes `%`.
fn sanitize(component: &str) -> String {
    use std::fmt::Write as _;

    if component.is_empty() {
        return "%".to_string();
    }
    let all_dots = component.bytes().all(|b| b == b'.');
    let mut out = String::with_capacity(component.len());
    for b in component.bytes() {
        let keep = b.is_ascii_alphanumeric()
            || matches!(b, b'_' | b'=' | b'-')
            || (b == b'.' && !all_dots);
        if keep {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

/// Render the full script text for `command`.
pub fn render_script(command: &str) -> String {
    let mut script = String::with_capacity(SCRIPT_PREAMBLE.len() + command.len() + 2);
    script.push_str(SCRIPT_PREAMBLE);
    script.push('\n');
    script.push_str(command);
    if !command.ends_with('\n') {
        script.push('\n');
    }
    script
}

/// Write the attempt's script to disk (creating the log directory) and make
/// it executable.
pub fn materialize(paths: &TaskPaths, command: &str) -> Result<()> {
    fs::create_dir_all(&paths.dir)?;
    fs::write(&paths.command, render_script(command))?;
    set_executable(&paths.command)?;
    debug!(script = %paths.command.display(), "materialized task script");
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
