//! Shared fixtures: a fake `aria2c` environment and an event tap.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use aria2_supervisor::config::{EngineSettings, MemorySettings};
use aria2_supervisor::dispatch::Dispatcher;
use aria2_supervisor::engine::EXECUTABLE_NAME;
use aria2_supervisor::{Event, LaunchOptions, Supervisor};

/// Upper bound for any single expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine stand-in. Prints one info line and one warning, records its pid in
/// `engine.pid`, then either sleeps (`--fake-mode=sleep`, the default) or
/// exits with `--fake-exit`.
pub const FAKE_ARIA2C: &str = r#"#!/bin/sh
if [ "$1" = "-v" ]; then
    echo "aria2 version 1.37.0"
    echo "Copyright (C) 2006, 2019 Tatsuhiro Tsujikawa"
    exit 0
fi
mode=sleep
code=0
for arg in "$@"; do
    case "$arg" in
        --fake-mode=*) mode="${arg#--fake-mode=}" ;;
        --fake-exit=*) code="${arg#--fake-exit=}" ;;
    esac
done
echo "03/14 01:02:03 [NOTICE] engine up"
echo "WARNING: low disk" 1>&2
echo $$ > engine.pid
if [ "$mode" = "exit" ]; then
    exit "$code"
fi
exec sleep 30
"#;

/// Temporary environment directory holding a fake engine.
pub struct FakeEngine {
    pub dir: tempfile::TempDir,
    pub session: PathBuf,
    pub settings: Arc<MemorySettings>,
}

impl FakeEngine {
    /// Environment whose executable runs `script`.
    pub fn with_script(script: &str) -> Self {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("temp dir");
        let exe = dir.path().join(EXECUTABLE_NAME);
        std::fs::write(&exe, script).expect("write fake engine");
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake engine");

        let session = dir.path().join("session.txt");
        let settings = Arc::new(MemorySettings::new(EngineSettings::new(
            dir.path().join("downloads"),
        )));

        Self {
            dir,
            session,
            settings,
        }
    }

    /// Environment with the standard fake engine.
    pub fn new() -> Self {
        Self::with_script(FAKE_ARIA2C)
    }

    /// Add a custom engine option.
    pub fn option(&self, name: &str, value: &str) {
        let (name, value) = (name.to_owned(), value.to_owned());
        self.settings.update(move |settings| {
            settings.custom_options.insert(name, value);
        });
    }

    /// Pid the fake engine recorded, waiting for it to appear.
    pub async fn engine_pid(&self) -> u32 {
        let path = self.dir.path().join("engine.pid");
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                if let Some(pid) = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|text| text.trim().parse().ok())
                {
                    return pid;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("fake engine recorded its pid")
    }

    /// Supervisor over this environment, environment already loaded.
    pub fn supervisor(&self, options: LaunchOptions) -> Supervisor {
        let supervisor = Supervisor::new(self.settings.clone(), options);
        supervisor
            .load_env(self.dir.path(), &self.session)
            .expect("fake environment loads");
        supervisor
    }
}

/// Engine stand-in that writes info lines as fast as it can until killed.
pub const FLOODING_ARIA2C: &str = r#"#!/bin/sh
while :; do
    echo "03/14 01:02:03 [NOTICE] tick"
done
"#;

/// Collects delivered events into a channel for assertions.
pub struct EventTap {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventTap {
    /// Subscribe a tap to a supervisor.
    pub fn attach(supervisor: &Supervisor) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        supervisor.subscribe(move |event: &Event| {
            let _ = tx.send(event.clone());
        });
        Self { rx }
    }

    /// Subscribe a tap to a bare dispatcher.
    pub fn attach_dispatcher(dispatcher: &Dispatcher) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(move |event: &Event| {
            let _ = tx.send(event.clone());
        });
        Self { rx }
    }

    /// Next event, failing the test after [`EVENT_TIMEOUT`].
    pub async fn next(&mut self) -> Event {
        tokio::time::timeout(EVENT_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Skip events until one satisfies `pred`.
    pub async fn wait_for(&mut self, pred: impl Fn(&Event) -> bool) -> Event {
        loop {
            let event = self.next().await;
            if pred(&event) {
                return event;
            }
        }
    }

    /// Every event delivered within `window`.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<Event> {
        let mut events = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.rx.recv()).await {
            events.push(event);
        }
        events
    }
}

/// True for a terminated event.
pub fn is_terminated(event: &Event) -> bool {
    matches!(event, Event::ProcessTerminated { .. })
}

/// True once `pid` has exited (reaped or zombie).
pub fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

/// Poll until `pid` has exited or `limit` passes.
pub async fn wait_until_gone(pid: u32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if process_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    process_gone(pid)
}
