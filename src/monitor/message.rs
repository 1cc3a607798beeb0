// src/monitor/message.rs

//! Wire format for the cloud message channel, and the producer side that
//! batches task output into messages.
//!
//! One message per line: `task_id \t kind \t base64(payload)`, where kind is
//! `out`, `err`, `exit` or `hb`.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;
use tracing::error;

use crate::errors::Result;

use super::channel::MessageQueue;

/// Buffered output is flushed once it grows past this many bytes.
pub const FLUSH_THRESHOLD: usize = 1024;

/// Encoded messages larger than this are dropped.
pub const MAX_MESSAGE_SIZE: usize = 250 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Stdout,
    Stderr,
    Exit,
    Heartbeat,
}

impl MessageKind {
    fn tag(self) -> &'static str {
        match self {
            MessageKind::Stdout => "out",
            MessageKind::Stderr => "err",
            MessageKind::Exit => "exit",
            MessageKind::Heartbeat => "hb",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "out" => Some(MessageKind::Stdout),
            "err" => Some(MessageKind::Stderr),
            "exit" => Some(MessageKind::Exit),
            "hb" => Some(MessageKind::Heartbeat),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub task_id: String,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessageError {
    #[error("expected 3 tab-separated fields, got {0}")]
    FieldCount(usize),

    #[error("unknown message kind '{0}'")]
    UnknownKind(String),

    #[error("empty task id")]
    EmptyTaskId,

    #[error("invalid base64 payload: {0}")]
    Payload(String),
}

impl Message {
    pub fn new(task_id: impl Into<String>, kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}\t{}\t{}",
            self.task_id,
            self.kind.tag(),
            STANDARD.encode(&self.payload)
        )
    }

    pub fn decode(line: &str) -> std::result::Result<Self, MessageError> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
        let [task_id, tag, payload] = fields.as_slice() else {
            return Err(MessageError::FieldCount(fields.len()));
        };
        if task_id.is_empty() {
            return Err(MessageError::EmptyTaskId);
        }
        let kind =
            MessageKind::from_tag(tag).ok_or_else(|| MessageError::UnknownKind(tag.to_string()))?;
        let payload = STANDARD
            .decode(payload)
            .map_err(|e| MessageError::Payload(e.to_string()))?;
        Ok(Self {
            task_id: task_id.to_string(),
            kind,
            payload,
        })
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Producer half: batches STDOUT/STDERR bytes into messages for one task.
#[derive(Debug)]
pub struct OutputReporter<Q: MessageQueue + ?Sized> {
    task_id: String,
    queue: std::sync::Arc<Q>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl<Q: MessageQueue + ?Sized> OutputReporter<Q> {
    pub fn new(task_id: impl Into<String>, queue: std::sync::Arc<Q>) -> Self {
        Self {
            task_id: task_id.into(),
            queue,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn stdout(&mut self, bytes: &[u8]) -> Result<()> {
        self.stdout.extend_from_slice(bytes);
        if self.stdout.len() > FLUSH_THRESHOLD {
            self.flush_kind(MessageKind::Stdout)?;
        }
        Ok(())
    }

    pub fn stderr(&mut self, bytes: &[u8]) -> Result<()> {
        self.stderr.extend_from_slice(bytes);
        if self.stderr.len() > FLUSH_THRESHOLD {
            self.flush_kind(MessageKind::Stderr)?;
        }
        Ok(())
    }

    pub fn heartbeat(&mut self) -> Result<()> {
        self.send(Message::new(self.task_id.clone(), MessageKind::Heartbeat, Vec::new()))
    }

    /// Flush pending output, then report the exit status text.
    pub fn exit(&mut self, status: &str) -> Result<()> {
        self.flush()?;
        self.send(Message::new(
            self.task_id.clone(),
            MessageKind::Exit,
            status.as_bytes().to_vec(),
        ))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.flush_kind(MessageKind::Stdout)?;
        self.flush_kind(MessageKind::Stderr)
    }

    fn flush_kind(&mut self, kind: MessageKind) -> Result<()> {
        let buf = match kind {
            MessageKind::Stdout => &mut self.stdout,
            MessageKind::Stderr => &mut self.stderr,
            _ => return Ok(()),
        };
        if buf.is_empty() {
            return Ok(());
        }
        let payload = std::mem::take(buf);
        self.send(Message::new(self.task_id.clone(), kind, payload))
    }

    fn send(&self, message: Message) -> Result<()> {
        let body = message.encode();
        if body.len() > MAX_MESSAGE_SIZE {
            error!(
                task = %self.task_id,
                kind = %message.kind,
                size = body.len(),
                "message too large, dropping"
            );
            return Ok(());
        }
        self.queue.send(&body)
    }
}
