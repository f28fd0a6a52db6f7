//! Resource monitor: periodic CPU and memory samples of the engine process.
//!
//! Every poll period the monitor runs a process-listing command, picks the
//! rows whose command column names the engine executable and, once the engine
//! pid is known, whose pid column is that pid. It publishes one
//! [`Event::MonitorUpdate`] per parsable row.
//!
//! The monitor is its own failure domain:
//!
//! - A row that does not match the column pattern is logged and skipped.
//! - A listing command that exits unsuccessfully is logged; polling continues.
//! - A listing command that cannot be launched at all publishes
//!   [`Event::MonitorFailed`] and ends the monitor. The engine is untouched.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::dispatch::EventSink;
use crate::events::{Event, ResourceSample};
use crate::AppError;

/// Default listing program.
pub const DEFAULT_LISTING_PROGRAM: &str = "ps";

/// Default listing arguments: one `PID %CPU RSS COMMAND` row per process,
/// without a header.
pub const DEFAULT_LISTING_ARGS: &[&str] = &[
    "-A", "-o", "pid=", "-o", "pcpu=", "-o", "rss=", "-o", "comm=",
];

/// `PID %CPU RSS(KiB) COMMAND` row.
#[allow(clippy::expect_used)]
static SAMPLE_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s+(\d+(?:[.,]\d+)?)\s+(\d+)\s+(.+)$")
        .expect("sample row pattern is a valid literal")
});

/// What to run and how often.
#[derive(Debug, Clone)]
pub struct MonitorSpec {
    /// Listing program.
    pub program: String,
    /// Listing program arguments.
    pub args: Vec<String>,
    /// Poll period.
    pub period: Duration,
    /// File name of the supervised executable, matched against the last column.
    pub executable_name: String,
    /// Pid of the supervised process; other processes are ignored.
    pub pid: Option<u32>,
}

impl MonitorSpec {
    /// Default `ps` listing for `executable_name`, polled every `period`.
    #[must_use]
    pub fn new(executable_name: impl Into<String>, period: Duration) -> Self {
        Self {
            program: DEFAULT_LISTING_PROGRAM.to_owned(),
            args: DEFAULT_LISTING_ARGS.iter().map(|&arg| arg.to_owned()).collect(),
            period,
            executable_name: executable_name.into(),
            pid: None,
        }
    }

    /// Only sample the process with this pid.
    #[must_use]
    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    /// Replace the listing command.
    #[must_use]
    pub fn with_command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.args = args;
        self
    }
}

/// Parse one listing row into a sample.
#[must_use]
pub fn parse_sample_line(line: &str) -> Option<ResourceSample> {
    let caps = SAMPLE_ROW.captures(line)?;
    let pid = caps.get(1)?.as_str().parse().ok()?;
    let cpu_percent = caps.get(2)?.as_str().replace(',', ".").parse().ok()?;
    let memory_kb = caps.get(3)?.as_str().parse().ok()?;

    Some(ResourceSample {
        pid,
        cpu_percent,
        memory_kb,
    })
}

/// Whether a listing row's command column is the supervised executable,
/// bare or as the last component of a path.
#[must_use]
pub fn names_executable(line: &str, executable_name: &str) -> bool {
    line.split_whitespace()
        .next_back()
        .and_then(|command| command.rsplit('/').next())
        == Some(executable_name)
}

/// Publish a sample for every matching row of one listing; returns how many
/// samples were published.
///
/// With `pid` set, rows of other processes running the same executable are
/// skipped.
pub fn scan_listing(
    listing: &str,
    executable_name: &str,
    pid: Option<u32>,
    sink: &EventSink,
) -> usize {
    let mut published = 0;
    for line in listing
        .lines()
        .filter(|line| names_executable(line, executable_name))
    {
        match parse_sample_line(line) {
            Some(sample) if pid.is_some_and(|pid| pid != sample.pid) => {
                debug!(pid = sample.pid, "skipping unrelated process");
            }
            Some(sample) => {
                sink.publish(Event::MonitorUpdate(sample));
                published += 1;
            }
            None => warn!(line, "unparsable process listing row, skipping"),
        }
    }
    published
}

/// Handle to a running monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Cancel the monitor and wait for it to return.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(%err, "resource monitor task failed");
        }
    }

    /// True once the monitor loop has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the monitor loop.
#[must_use]
pub fn spawn_monitor(spec: MonitorSpec, sink: EventSink, cancel: CancellationToken) -> MonitorHandle {
    let task = tokio::spawn(
        run(spec, sink, cancel.clone()).instrument(info_span!("resource_monitor")),
    );
    MonitorHandle { cancel, task }
}

async fn run(spec: MonitorSpec, sink: EventSink, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(spec.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            output = command.output() => output,
        };

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                let error = AppError::Monitor(format!("failed to run {}: {err}", spec.program));
                warn!(%error, "process listing unavailable, stopping monitor");
                sink.publish(Event::MonitorFailed {
                    error: error.to_string(),
                });
                return;
            }
        };

        if !output.status.success() {
            warn!(program = spec.program, status = %output.status, "process listing exited unsuccessfully");
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        let samples = scan_listing(&listing, &spec.executable_name, spec.pid, &sink);
        if samples == 0 {
            debug!(executable = spec.executable_name, "no matching process in listing");
        }
    }

    debug!("resource monitor stopped");
}
