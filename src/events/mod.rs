//! Events produced by the supervisor and delivered through the dispatcher.
//!
//! Every producer (stream watchers, the resource monitor, the waiter, and the
//! control surface) speaks [`Event`]. Events are immutable values: they are
//! created where the condition is detected and dropped after every listener
//! has seen them.

pub mod wire;

use serde::{Deserialize, Serialize};

/// Marker command line reported when `start()` finds the engine already running.
pub const ALREADY_STARTED: &str = "[already started]";

/// One sample of the engine's OS-level resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Process id reported by the listing command.
    pub pid: u32,
    /// CPU usage in percent.
    pub cpu_percent: f32,
    /// Resident memory in KiB.
    pub memory_kb: u64,
}

/// Lifecycle transitions, classified log lines, and resource samples.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The engine was launched, or a start was requested while it was running.
    ProcessStarted {
        /// Full command line for auditing, or [`ALREADY_STARTED`].
        command_line: String,
    },
    /// The engine exited.
    ProcessTerminated {
        /// Exit code; `128 + signal` for signal deaths on Unix, `999` when the
        /// wait itself failed.
        exit_code: i32,
    },
    /// Informational output line.
    ProcessInfo {
        /// Message text with any timestamp/tag prefix removed.
        text: String,
    },
    /// Line the engine flagged as a warning.
    ProcessWarn {
        /// Text after the `WARNING: ` prefix.
        text: String,
    },
    /// Line the engine flagged as an error, or a launch failure.
    ProcessError {
        /// Text after the `ERROR: ` prefix, or the launch failure reason.
        text: String,
    },
    /// Resource monitor sample.
    MonitorUpdate(ResourceSample),
    /// The resource monitor could not run and has stopped.
    MonitorFailed {
        /// Reason the listing command could not be launched.
        error: String,
    },
    /// The engine switched between running and idle.
    StatusChanged {
        /// Whether an engine process is now running.
        running: bool,
    },
}

impl Event {
    /// Short stable name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessStarted { .. } => "process_started",
            Self::ProcessTerminated { .. } => "process_terminated",
            Self::ProcessInfo { .. } => "process_info",
            Self::ProcessWarn { .. } => "process_warn",
            Self::ProcessError { .. } => "process_error",
            Self::MonitorUpdate(_) => "monitor_update",
            Self::MonitorFailed { .. } => "monitor_failed",
            Self::StatusChanged { .. } => "status_changed",
        }
    }
}
