//! Serialization contract for events that leave the process.
//!
//! A consumer in another process sees each event as a
//! `{type, i, payload}` triple:
//!
//! | `type`               | `i`          | `payload`                           |
//! |----------------------|--------------|-------------------------------------|
//! | `PROCESS_STARTED`    | `0`          | command line                        |
//! | `PROCESS_TERMINATED` | exit code    | `null`                              |
//! | `PROCESS_INFO`       | `0`          | message text                        |
//! | `PROCESS_WARN`       | `0`          | message text                        |
//! | `PROCESS_ERROR`      | `0`          | message text                        |
//! | `MONITOR_UPDATE`     | `0`          | `{pid, cpu_percent, memory_kb}`     |
//! | `MONITOR_FAILED`     | `0`          | error text                          |
//! | `STATUS_CHANGED`     | `1` or `0`   | `null`                              |
//!
//! The transport is up to the embedder; [`JsonLinesListener`] writes one JSON
//! object per line to any writer.
//!
//! [`JsonLinesListener`]: crate::dispatch::listeners::JsonLinesListener

use serde::{Deserialize, Serialize};

use super::{Event, ResourceSample};

/// Type tag of a [`WireMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// See [`Event::ProcessStarted`].
    ProcessStarted,
    /// See [`Event::ProcessTerminated`].
    ProcessTerminated,
    /// See [`Event::ProcessInfo`].
    ProcessInfo,
    /// See [`Event::ProcessWarn`].
    ProcessWarn,
    /// See [`Event::ProcessError`].
    ProcessError,
    /// See [`Event::MonitorUpdate`].
    MonitorUpdate,
    /// See [`Event::MonitorFailed`].
    MonitorFailed,
    /// See [`Event::StatusChanged`].
    StatusChanged,
}

/// Optional payload slot of a [`WireMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WirePayload {
    /// Single string payload.
    Text(String),
    /// Structured resource sample.
    Sample(ResourceSample),
}

/// Flat, serializable rendering of an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Event type tag.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Integer slot (exit code or running flag).
    pub i: i32,
    /// Optional payload.
    pub payload: Option<WirePayload>,
}

impl WireMessage {
    fn text(kind: MessageKind, text: &str) -> Self {
        Self {
            kind,
            i: 0,
            payload: Some(WirePayload::Text(text.to_owned())),
        }
    }
}

impl From<&Event> for WireMessage {
    fn from(event: &Event) -> Self {
        match event {
            Event::ProcessStarted { command_line } => {
                Self::text(MessageKind::ProcessStarted, command_line)
            }
            Event::ProcessTerminated { exit_code } => Self {
                kind: MessageKind::ProcessTerminated,
                i: *exit_code,
                payload: None,
            },
            Event::ProcessInfo { text } => Self::text(MessageKind::ProcessInfo, text),
            Event::ProcessWarn { text } => Self::text(MessageKind::ProcessWarn, text),
            Event::ProcessError { text } => Self::text(MessageKind::ProcessError, text),
            Event::MonitorUpdate(sample) => Self {
                kind: MessageKind::MonitorUpdate,
                i: 0,
                payload: Some(WirePayload::Sample(*sample)),
            },
            Event::MonitorFailed { error } => Self::text(MessageKind::MonitorFailed, error),
            Event::StatusChanged { running } => Self {
                kind: MessageKind::StatusChanged,
                i: i32::from(*running),
                payload: None,
            },
        }
    }
}
