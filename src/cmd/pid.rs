// src/cmd/pid.rs

//! First-line identifier protocol.
//!
//! A spawned wrapper (or submit command) prints its PID / job id / instance id
//! on the first line of STDOUT. [`read_pid_line`] reads that line with a hard
//! length cap and a [`PidParser`] extracts the identifier from it.

use std::fmt::Debug;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Maximum length of the identifier line, newline excluded.
///
/// Lines of `MAX_PID_LINE_LENGTH - 1` bytes are accepted; anything longer is
/// a protocol violation.
pub const MAX_PID_LINE_LENGTH: usize = 1024;

#[derive(Error, Debug)]
pub enum PidLineError {
    #[error("identifier line exceeds {limit} bytes")]
    TooLong { limit: usize },

    #[error("identifier line is not valid UTF-8")]
    InvalidUtf8,

    #[error("reading identifier line: {0}")]
    Io(#[from] std::io::Error),
}

/// Read the first non-blank line.
///
/// Returns `Ok(None)` when the stream closes before any content arrives.
/// A final line without a trailing newline is still returned. The reader is
/// left positioned right after the consumed newline, so the caller can keep
/// using it for the rest of the stream.
pub async fn read_pid_line<R>(reader: &mut R) -> Result<Option<String>, PidLineError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return if line.iter().all(u8::is_ascii_whitespace) {
                Ok(None)
            } else {
                finish_line(line).map(Some)
            };
        }

        match buf.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                ensure_within_limit(line.len() + pos)?;
                line.extend_from_slice(&buf[..pos]);
                reader.consume(pos + 1);
                if line.iter().all(u8::is_ascii_whitespace) {
                    line.clear();
                    continue;
                }
                return finish_line(line).map(Some);
            }
            None => {
                let len = buf.len();
                ensure_within_limit(line.len() + len)?;
                line.extend_from_slice(buf);
                reader.consume(len);
            }
        }
    }
}

fn ensure_within_limit(len: usize) -> Result<(), PidLineError> {
    if len >= MAX_PID_LINE_LENGTH {
        return Err(PidLineError::TooLong {
            limit: MAX_PID_LINE_LENGTH,
        });
    }
    Ok(())
}

fn finish_line(mut line: Vec<u8>) -> Result<String, PidLineError> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| PidLineError::InvalidUtf8)
}

/// Extracts a backend identifier from the first output line.
pub trait PidParser: Send + Sync + Debug {
    /// `None` means the line does not carry an identifier.
    fn parse(&self, line: &str) -> Option<String>;
}

/// The line itself, trimmed.
#[derive(Debug, Clone, Default)]
pub struct TrimPidParser;

impl PidParser for TrimPidParser {
    fn parse(&self, line: &str) -> Option<String> {
        let id = line.trim();
        (!id.is_empty()).then(|| id.to_string())
    }
}

/// `PID \t pid \t child_pid` lines; falls back to the trimmed line.
#[derive(Debug, Clone, Default)]
pub struct TabPidParser;

impl PidParser for TabPidParser {
    fn parse(&self, line: &str) -> Option<String> {
        let fields: Vec<&str> = line.trim().split('\t').map(str::trim).collect();
        match fields.as_slice() {
            ["PID", pid, ..] if !pid.is_empty() => Some(pid.to_string()),
            ["PID", ..] => None,
            _ => TrimPidParser.parse(line),
        }
    }
}

/// Regex extraction, e.g. a job id out of `Submitted batch job 1234`.
///
/// Uses the first capture group when there is one, the whole match otherwise.
#[derive(Debug, Clone)]
pub struct RegexPidParser {
    regex: Regex,
}

impl RegexPidParser {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }
}

impl PidParser for RegexPidParser {
    fn parse(&self, line: &str) -> Option<String> {
        let caps = self.regex.captures(line)?;
        let m = caps.get(1).or_else(|| caps.get(0))?;
        let id = m.as_str().trim();
        (!id.is_empty()).then(|| id.to_string())
    }
}
