//! Ready-made listeners.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, error, info, warn};

use crate::events::wire::WireMessage;
use crate::events::Event;

use super::Listener;

/// Mirrors engine events into `tracing` at a matching level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl Listener for TracingListener {
    fn on_event(&self, event: &Event) {
        match event {
            Event::ProcessStarted { command_line } => info!(command_line, "engine started"),
            Event::ProcessTerminated { exit_code } => info!(exit_code, "engine terminated"),
            Event::ProcessInfo { text } => info!(target: "aria2c", "{text}"),
            Event::ProcessWarn { text } => warn!(target: "aria2c", "{text}"),
            Event::ProcessError { text } => error!(target: "aria2c", "{text}"),
            Event::MonitorUpdate(sample) => debug!(
                pid = sample.pid,
                cpu_percent = sample.cpu_percent,
                memory_kb = sample.memory_kb,
                "engine resource sample"
            ),
            Event::MonitorFailed { error } => warn!(error, "resource monitor stopped"),
            Event::StatusChanged { running } => debug!(running, "engine status changed"),
        }
    }
}

/// Writes each event as one [`WireMessage`] JSON line.
#[derive(Debug)]
pub struct JsonLinesListener<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesListener<W> {
    /// Listener writing to `out`.
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> Listener for JsonLinesListener<W> {
    fn on_event(&self, event: &Event) {
        let message = WireMessage::from(event);
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);

        let written = serde_json::to_writer(&mut *out, &message)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"))
            .and_then(|()| out.flush());

        if let Err(err) = written {
            warn!(%err, event = event.name(), "failed to write wire message");
        }
    }
}
