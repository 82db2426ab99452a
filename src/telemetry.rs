//! Structured session events
//!
//! The core reports what it is doing as [`LogEntry`] values handed to a
//! [`LogSink`]. How entries are displayed or stored is up to the sink; the
//! default [`TracingSink`] turns each one into a `tracing` event.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};

/// Pipeline stage an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    /// Connection lifecycle
    System,
    /// Microphone capture and user transcription
    Asr,
    /// Model transcription
    Llm,
    /// Received synthesized audio
    Tts,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Success,
    Error,
    Info,
}

/// One structured event
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub stage: Stage,
    pub status: Status,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(stage: Stage, status: Status, message: impl Into<String>) -> Self {
        Self {
            stage,
            status,
            message: message.into(),
            data: None,
            duration: None,
            timestamp: Utc::now(),
        }
    }

    pub fn info(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Status::Info, message)
    }

    pub fn success(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Status::Success, message)
    }

    pub fn error(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Status::Error, message)
    }

    pub fn with_data(mut self, data: impl Into<serde_json::Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Destination for structured session events
pub trait LogSink: Send + Sync {
    fn emit(&self, entry: LogEntry);
}

/// Forwards entries to the `tracing` subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, entry: LogEntry) {
        let duration_ms = entry.duration.map(|d| d.as_secs_f64() * 1000.0);
        match entry.status {
            Status::Error => error!(
                stage = ?entry.stage,
                data = ?entry.data,
                duration_ms,
                "{}",
                entry.message
            ),
            Status::Success | Status::Info => info!(
                stage = ?entry.stage,
                status = ?entry.status,
                data = ?entry.data,
                duration_ms,
                "{}",
                entry.message
            ),
        }
    }
}
