// src/logging.rs

//! Logging setup for `pipeworks` using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `PIPEWORKS_LOG` environment variable, any `EnvFilter` directive string
//!    (e.g. `"debug"`, `"pipeworks::executioner=trace,info"`)
//! 3. the subcommand's default level
//!
//! Logs are sent to STDERR. STDOUT carries task output and, for the `exec`
//! wrapper, the PID line the parent process reads first.

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "PIPEWORKS_LOG";

/// Initialise global logging subscriber.
///
/// Safe to call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>, default: Level) -> Result<()> {
    let filter = build_filter(cli_level, std::env::var(LOG_ENV).ok(), default)?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("cannot install log subscriber: {e}"))
}

fn build_filter(
    cli_level: Option<LogLevel>,
    env_value: Option<String>,
    default: Level,
) -> Result<EnvFilter> {
    if let Some(lvl) = cli_level {
        return Ok(only(level_from_log_level(lvl)));
    }
    match env_value.as_deref().map(str::trim) {
        Some(spec) if !spec.is_empty() => EnvFilter::try_new(spec)
            .map_err(|e| anyhow!("invalid {LOG_ENV} value '{spec}': {e}")),
        _ => Ok(only(default)),
    }
}

fn only(level: Level) -> EnvFilter {
    EnvFilter::default().add_directive(LevelFilter::from_level(level).into())
}

fn level_from_log_level(lvl: LogLevel) -> Level {
    match lvl {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(filter: EnvFilter) -> Option<LevelFilter> {
        filter.max_level_hint()
    }

    #[test]
    fn cli_flag_beats_environment() {
        let f = build_filter(Some(LogLevel::Trace), Some("error".into()), Level::INFO).unwrap();
        assert_eq!(hint(f), Some(LevelFilter::TRACE));
    }

    #[test]
    fn environment_accepts_directives() {
        let f = build_filter(None, Some("pipeworks=debug,warn".into()), Level::INFO).unwrap();
        assert_eq!(hint(f), Some(LevelFilter::DEBUG));
        assert!(build_filter(None, Some("pipeworks=loud".into()), Level::INFO).is_err());
    }

    #[test]
    fn blank_environment_falls_back_to_default() {
        let f = build_filter(None, Some("  ".into()), Level::WARN).unwrap();
        assert_eq!(hint(f), Some(LevelFilter::WARN));
    }
}
