use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Which executioner backend runs a task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SystemKind {
    /// Processes on this host.
    Local,
    /// Jobs submitted to a cluster scheduler (possibly over a remote shell).
    Cluster,
    /// Freshly provisioned cloud instances reporting over a message channel.
    Cloud,
}

impl Default for SystemKind {
    fn default() -> Self {
        SystemKind::Local
    }
}

impl fmt::Display for SystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SystemKind::Local => "local",
            SystemKind::Cluster => "cluster",
            SystemKind::Cloud => "cloud",
        };
        f.write_str(s)
    }
}

impl FromStr for SystemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(SystemKind::Local),
            "cluster" => Ok(SystemKind::Cluster),
            "cloud" => Ok(SystemKind::Cloud),
            other => Err(format!(
                "invalid system: {other} (expected \"local\", \"cluster\" or \"cloud\")"
            )),
        }
    }
}

/// Completion-detection strategy used by an executioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    /// Poll for `{id}.exitCode` files.
    ExitFile,
    /// Drain a message channel.
    Queue,
}

/// How the local backend wraps a task's program file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    /// A `sh -c` one-liner that prints `$$` and writes the exit file.
    Shell,
    /// Our own `exec` subcommand (adds timeout and signal handling).
    Exec,
}

impl Default for LauncherKind {
    fn default() -> Self {
        LauncherKind::Shell
    }
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
