// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `drmflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "drmflow",
    version,
    about = "Expand tagged workflow stages into tasks and run them on local or cluster backends.",
    long_about = None
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DRMFLOW_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run (or resume) the workflow described by a TOML file.
    Run(RunArgs),
    /// Print the persisted status of a workflow.
    Status(StatusArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Path to the workflow file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Drmflow.toml")]
    pub config: PathBuf,

    /// Delete the persisted graph and start from scratch instead of resuming.
    #[arg(long)]
    pub restart: bool,

    /// Expand and print the task graph, but submit nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// Directory holding persisted workflow graphs.
    #[arg(long, value_name = "PATH", default_value = ".drmflow")]
    pub store: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    /// Workflow name.
    pub name: String,

    /// Directory holding persisted workflow graphs.
    #[arg(long, value_name = "PATH", default_value = ".drmflow")]
    pub store: PathBuf,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let args = CliArgs::try_parse_from([
            "drmflow", "run", "--config", "wf.toml", "--restart", "--log-level", "debug",
        ])
        .unwrap();
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.config, PathBuf::from("wf.toml"));
        assert!(run.restart);
        assert!(!run.dry_run);
        assert_eq!(run.store, PathBuf::from(".drmflow"));
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }
}
