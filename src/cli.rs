// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::types::SystemKind;

/// Command-line arguments for `pipeworks`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pipeworks",
    version,
    about = "Run pipelines of external tasks with Make-like dependencies and crash recovery.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PIPEWORKS_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a pipeline file.
    Run(RunArgs),

    /// Wrapper used by executioners: print PID, run a command, write exit files.
    ///
    /// A file name of `-` disables the corresponding redirection.
    Exec(ExecArgs),

    /// Send a termination signal to one or more process groups.
    Kill {
        #[arg(required = true)]
        pids: Vec<i32>,
    },

    /// Cloud-instance side: restore a single-task checkpoint and run it,
    /// reporting output over the message channel.
    TaskExec {
        #[arg(long, value_name = "FILE")]
        checkpoint: PathBuf,

        #[arg(long, value_name = "DIR")]
        queue: PathBuf,

        /// Seconds between heartbeat messages.
        #[arg(long, default_value_t = 30)]
        heartbeat_secs: u64,
    },
}

impl Command {
    /// Log level used when neither `--log-level` nor `PIPEWORKS_LOG` is set.
    ///
    /// The wrappers share STDERR with the task they run, so they stay quiet.
    pub fn default_log_level(&self) -> tracing::Level {
        match self {
            Command::Run(_) => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Path to the pipeline file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Pipeline.toml")]
    pub config: PathBuf,

    /// Resume from a checkpoint written by a previous (failed) run.
    #[arg(long, value_name = "CHECKPOINT")]
    pub resume: Option<PathBuf>,

    /// Override the default system for tasks that don't name one.
    #[arg(long, value_enum)]
    pub system: Option<SystemKind>,

    /// Parse + validate, print the task list, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ExecArgs {
    /// Maximum run time in seconds (0 = no limit).
    pub timeout_secs: u64,
    pub stdout: String,
    pub stderr: String,
    pub exit_file: String,
    pub command: String,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
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
    fn exec_accepts_trailing_hyphen_arguments() {
        let args = CliArgs::try_parse_from([
            "pipeworks", "exec", "10", "out", "err", "exit", "ls", "-la", "/tmp",
        ])
        .unwrap();
        match args.command {
            Command::Exec(exec) => {
                assert_eq!(exec.timeout_secs, 10);
                assert_eq!(exec.command, "ls");
                assert_eq!(exec.args, vec!["-la", "/tmp"]);
            }
            other => panic!("expected exec, got {other:?}"),
        }
    }

    #[test]
    fn run_defaults_to_pipeline_toml() {
        let args = CliArgs::try_parse_from(["pipeworks", "run"]).unwrap();
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.config, PathBuf::from("Pipeline.toml"));
                assert!(run.resume.is_none());
            }
            other => panic!("expected run, got {other:?}"),
        }
    }
}
