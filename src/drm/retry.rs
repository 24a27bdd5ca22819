// src/drm/retry.rs

//! Running backend CLI commands, with bounded retry for status queries.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::errors::{FlowError, Result};

/// Retry policy for backend status queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial: Duration::from_millis(500),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }
}

/// Delay before retry number `retry` (0-based), capped at `policy.max`.
pub fn backoff_duration(retry: u32, policy: &BackoffPolicy) -> Duration {
    let exp = policy.multiplier.powi(retry as i32);
    let raw = policy.initial.as_millis() as f64 * exp;
    let bounded = raw.min(policy.max.as_millis() as f64).max(0.0);
    Duration::from_millis(bounded.round() as u64)
}

fn render(program: &str, args: &[String]) -> String {
    let mut s = program.to_string();
    for a in args {
        s.push(' ');
        s.push_str(a);
    }
    s
}

/// Run a command once and return its stdout.
///
/// Fails on spawn errors, timeouts and non-zero exit codes; the error
/// carries stderr for diagnostics.
pub async fn check_output(program: &str, args: &[String], limit: Duration) -> anyhow::Result<String> {
    let rendered = render(program, args);
    debug!(command = %rendered, "running backend command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning `{rendered}`"))?;

    let output = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| anyhow!("`{rendered}` timed out after {limit:?}"))?
        .with_context(|| format!("waiting for `{rendered}`"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "`{rendered}` exited with {}: {}",
            output.status,
            stderr.trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a status query with bounded retries and exponential backoff.
///
/// Timeouts, non-zero exits and (unless `allow_empty`) empty output are
/// retried. After the last attempt a [`FlowError::Transport`] is returned so
/// the caller can leave its jobs in flight instead of guessing.
pub async fn check_output_with_backoff(
    program: &str,
    args: &[String],
    policy: &BackoffPolicy,
    allow_empty: bool,
) -> Result<String> {
    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        match check_output(program, args, policy.timeout).await {
            Ok(out) if allow_empty || !out.trim().is_empty() => return Ok(out),
            Ok(_) => last_error = "empty output".to_string(),
            Err(e) => last_error = format!("{e:#}"),
        }

        if attempt + 1 < attempts {
            let delay = backoff_duration(attempt, policy);
            warn!(
                command = %render(program, args),
                attempt = attempt + 1,
                ?delay,
                error = %last_error,
                "status query failed; backing off"
            );
            sleep(delay).await;
        }
    }

    Err(FlowError::Transport {
        command: render(program, args),
        attempts,
        message: last_error,
    })
}
