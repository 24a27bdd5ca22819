// src/logging.rs

//! Subscriber setup for the `drmflow` binary.
//!
//! `--log-level` sets one level for everything. Without it, `DRMFLOW_LOG`
//! is read as a `tracing` filter, so per-module directives such as
//! `drmflow::drm=debug,info` work. Anything else falls back to `info`.
//!
//! Output goes to stderr; stdout carries dry-run listings and status tables.

use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::cli::LogLevel;

const LOG_ENV: &str = "DRMFLOW_LOG";

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Install the global subscriber. Fails if one is already set.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(cli_level, env.as_deref()))
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to initialise logging: {e}"))
}

fn build_filter(cli_level: Option<LogLevel>, env: Option<&str>) -> EnvFilter {
    if let Some(level) = cli_level {
        return EnvFilter::new(Level::from(level).as_str());
    }
    env.map(str::trim)
        .filter(|directives| !directives.is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(Level::INFO.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max(filter: EnvFilter) -> Option<Level> {
        filter.max_level_hint().and_then(|hint| hint.into_level())
    }

    #[test]
    fn flag_beats_env_beats_default() {
        assert_eq!(max(build_filter(Some(LogLevel::Warn), Some("trace"))), Some(Level::WARN));
        assert_eq!(max(build_filter(None, Some(" debug "))), Some(Level::DEBUG));
        assert_eq!(max(build_filter(None, Some("drmflow::drm=trace,warn"))), Some(Level::TRACE));
        assert_eq!(max(build_filter(None, Some("drmflow=loud"))), Some(Level::INFO));
        assert_eq!(max(build_filter(None, None)), Some(Level::INFO));
    }
}
