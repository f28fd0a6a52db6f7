//! Engine process supervisor.
//!
//! [`Supervisor`] owns the lifecycle state machine of the `aria2c` child:
//!
//! ```text
//!   Idle ──start()──► Running ──(child exits | stop())──► Idle
//! ```
//!
//! One tokio mutex guards the run state; `start()` and `stop()` both take it,
//! so at most one child exists at a time. Each run owns:
//!
//! - a waiter task that reaps the child and drives teardown on natural exit,
//! - one stream watcher per output pipe (one when streams are merged),
//! - a resource monitor when `show_performance` is enabled.
//!
//! Teardown always closes the monitor, then the stderr watcher, then the
//! stdout watcher, then releases the child handle. A stop signals the kill
//! before any of that so the pipes close. Runs carry a generation id
//! so a waiter that finishes late never tears down a newer run.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::SettingsSource;
use crate::dispatch::{Dispatcher, EventSink, Listener, ListenerId};
use crate::events::{Event, ALREADY_STARTED};
use crate::monitor::{spawn_monitor, MonitorHandle, MonitorSpec};
use crate::stream::{spawn_watcher, Classifier, StreamKind, WatcherHandle};
use crate::{AppError, Result};

use super::environment::{Environment, EXECUTABLE_NAME};

/// Exit code reported when waiting on the child failed.
pub const ABNORMAL_EXIT_CODE: i32 = 999;

/// How long watchers may keep reading after the engine exited on its own.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Engine output pipe, boxed so merged and separate modes share one type.
type EngineStream = Box<dyn AsyncRead + Unpin + Send>;

// ── Options ──────────────────────────────────────────────────────────────────

/// Launch-time options fixed for the supervisor's lifetime.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Route the engine's stderr into its stdout pipe and watch one stream.
    pub merge_streams: bool,
    /// Replace the resource monitor's listing command (`program`, `args`).
    pub listing_command: Option<(String, Vec<String>)>,
}

/// Result of a [`Supervisor::start`] call that did not fail outright.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new engine process was spawned.
    Started,
    /// An engine process was already running; nothing was spawned.
    AlreadyRunning,
    /// The operating system refused to spawn the engine. Reported through
    /// `ProcessError` and `StatusChanged { running: false }`.
    LaunchFailed,
}

// ── Run state ────────────────────────────────────────────────────────────────

/// Why a run is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// `stop()` or `delete()`; the child is still alive.
    Stop,
    /// The child exited; its pipes are at or near end-of-stream.
    Exited,
}

struct ActiveRun {
    run_id: u64,
    /// Parent of every per-run token; cancelling it kills the child.
    cancel: CancellationToken,
    /// Held by the waiter; cancelling it kills the child.
    kill: CancellationToken,
    waiter: Option<JoinHandle<()>>,
    monitor: Option<MonitorHandle>,
    error_watcher: Option<WatcherHandle>,
    info_watcher: Option<WatcherHandle>,
}

impl ActiveRun {
    /// Close per-run tasks in teardown order, then release the child.
    ///
    /// Returns the waiter handle so the caller can await the reap outside the
    /// state lock.
    async fn teardown(mut self, reason: Teardown) -> Option<JoinHandle<()>> {
        if reason == Teardown::Stop {
            self.kill.cancel();
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.close().await;
        }
        for watcher in [self.error_watcher.take(), self.info_watcher.take()]
            .into_iter()
            .flatten()
        {
            match reason {
                Teardown::Stop => watcher.close().await,
                Teardown::Exited => watcher.drain(DRAIN_GRACE).await,
            }
        }
        self.cancel.cancel();
        debug!(run_id = self.run_id, ?reason, "run torn down");
        self.waiter.take()
    }
}

#[derive(Default)]
enum RunState {
    #[default]
    Idle,
    Running(ActiveRun),
}

impl RunState {
    fn run_id(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Running(run) => Some(run.run_id),
        }
    }

    fn take(&mut self) -> Option<ActiveRun> {
        match std::mem::take(self) {
            Self::Idle => None,
            Self::Running(run) => Some(run),
        }
    }
}

struct Inner {
    settings: Arc<dyn SettingsSource>,
    options: LaunchOptions,
    classifier: Arc<Classifier>,
    events: EventSink,
    env: Mutex<Option<Environment>>,
    state: tokio::sync::Mutex<RunState>,
    /// Token of the latest run, reachable without the state lock.
    run_token: Mutex<Option<CancellationToken>>,
    running: AtomicBool,
    next_run_id: AtomicU64,
}

impl Inner {
    fn current_env(&self) -> Option<Environment> {
        self.env
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn load_env(&self, base_dir: &Path, session_file: &Path) -> Result<Environment> {
        let settings = self.settings.load()?;
        let env = Environment::load(base_dir, session_file, settings)?;
        *self.env.lock().unwrap_or_else(PoisonError::into_inner) = Some(env.clone());
        Ok(env)
    }

    /// Re-resolve the loaded environment so settings edits take effect.
    fn reload_env(&self) -> Result<Environment> {
        let current = self
            .current_env()
            .ok_or_else(|| AppError::BadEnvironment("no environment loaded".into()))?;
        self.load_env(current.base_dir(), current.session_file())
    }

    fn monitor_spec(&self, env: &Environment, pid: Option<u32>) -> MonitorSpec {
        let period = Duration::from_secs(env.settings().performance_interval_seconds);
        let spec = MonitorSpec::new(EXECUTABLE_NAME, period).with_pid(pid);
        match &self.options.listing_command {
            Some((program, args)) => spec.with_command(program.clone(), args.clone()),
            None => spec,
        }
    }

    /// Called by the waiter of `run_id` once its child has exited.
    async fn finish_run(&self, run_id: u64) {
        let mut state = self.state.lock().await;
        if state.run_id() != Some(run_id) {
            debug!(run_id, "run already torn down");
            return;
        }
        if let Some(run) = state.take() {
            self.running.store(false, Ordering::SeqCst);
            // The returned handle is this waiter's own.
            drop(run.teardown(Teardown::Exited).await);
        }
    }
}

// ── Supervisor ───────────────────────────────────────────────────────────────

/// Control surface for one `aria2c` engine.
///
/// Share it through `Arc`; every method takes `&self`. Must be created inside
/// a tokio runtime.
pub struct Supervisor {
    inner: Arc<Inner>,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("options", &self.inner.options)
            .field("running", &self.is_running())
            .field("has_environment", &self.has_environment())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create an idle supervisor reading engine options from `settings`.
    #[must_use]
    pub fn new(settings: Arc<dyn SettingsSource>, options: LaunchOptions) -> Self {
        let dispatcher = Dispatcher::spawn();
        let inner = Arc::new(Inner {
            settings,
            options,
            classifier: Arc::new(Classifier::standard()),
            events: dispatcher.sink(),
            env: Mutex::new(None),
            state: tokio::sync::Mutex::new(RunState::Idle),
            run_token: Mutex::new(None),
            running: AtomicBool::new(false),
            next_run_id: AtomicU64::new(0),
        });
        Self { inner, dispatcher }
    }

    // ── Events ───────────────────────────────────────────────────────────

    /// Register a listener for every subsequent event.
    pub fn subscribe(&self, listener: impl Listener + 'static) -> ListenerId {
        self.dispatcher.subscribe(listener)
    }

    /// Register an already shared listener.
    pub fn subscribe_shared(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.dispatcher.subscribe_shared(listener)
    }

    /// Remove a listener; returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    // ── Environment ──────────────────────────────────────────────────────

    /// Validate and adopt an engine environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadEnvironment` if the layout is invalid, or
    /// `AppError::Config` if the settings source cannot be read. The previous
    /// environment stays in place on error.
    pub fn load_env(&self, base_dir: &Path, session_file: &Path) -> Result<()> {
        let env = self.inner.load_env(base_dir, session_file)?;
        info!(dir = %env.base_dir().display(), "environment loaded");
        Ok(())
    }

    /// True once an environment has been loaded.
    #[must_use]
    pub fn has_environment(&self) -> bool {
        self.inner
            .env
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Copy of the current environment, if any.
    #[must_use]
    pub fn environment(&self) -> Option<Environment> {
        self.inner.current_env()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// True while an engine process is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Launch the engine.
    ///
    /// Calling `start` while the engine runs is not an error: it publishes
    /// `ProcessStarted` with the `[already started]` marker and returns
    /// [`StartOutcome::AlreadyRunning`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadEnvironment` if no environment is loaded or it no
    /// longer validates, and `AppError::Config` if the settings cannot be
    /// read. Spawn failures are reported as [`StartOutcome::LaunchFailed`].
    pub async fn start(&self) -> Result<StartOutcome> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if let Some(run_id) = state.run_id() {
            info!(run_id, "start requested while engine is running");
            inner.events.publish(Event::ProcessStarted {
                command_line: ALREADY_STARTED.to_owned(),
            });
            return Ok(StartOutcome::AlreadyRunning);
        }

        let env = inner.reload_env()?;
        let run_id = inner.next_run_id.fetch_add(1, Ordering::SeqCst) + 1;

        let (child, stdout, stderr) = match spawn_engine(&env, inner.options.merge_streams) {
            Ok(spawned) => spawned,
            Err(err) => {
                debug!(run_id, %err, "engine launch failed");
                inner.events.publish(Event::ProcessError {
                    text: err.to_string(),
                });
                inner.events.publish(Event::StatusChanged { running: false });
                return Ok(StartOutcome::LaunchFailed);
            }
        };

        let pid = child.id();
        info!(run_id, pid, "engine started");
        inner.events.publish(Event::ProcessStarted {
            command_line: env.command_line(),
        });
        inner.events.publish(Event::StatusChanged { running: true });

        let cancel = CancellationToken::new();
        let error_watcher = stderr.map(|reader| {
            spawn_watcher(
                StreamKind::Stderr,
                reader,
                Arc::clone(&inner.classifier),
                inner.events.clone(),
                cancel.child_token(),
            )
        });
        let info_watcher = spawn_watcher(
            StreamKind::Stdout,
            stdout,
            Arc::clone(&inner.classifier),
            inner.events.clone(),
            cancel.child_token(),
        );
        let monitor = env.settings().show_performance.then(|| {
            spawn_monitor(
                inner.monitor_spec(&env, pid),
                inner.events.clone(),
                cancel.child_token(),
            )
        });
        let kill = cancel.child_token();
        let waiter = tokio::spawn(
            wait_for_exit(Arc::clone(inner), run_id, child, kill.clone())
                .instrument(info_span!("waiter", run_id)),
        );

        *inner.run_token.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());
        *state = RunState::Running(ActiveRun {
            run_id,
            cancel,
            kill,
            waiter: Some(waiter),
            monitor,
            error_watcher,
            info_watcher: Some(info_watcher),
        });
        inner.running.store(true, Ordering::SeqCst);

        Ok(StartOutcome::Started)
    }

    /// Kill the engine if it runs and wait until it has been reaped.
    ///
    /// Idempotent. Publishes nothing itself; `ProcessTerminated` and
    /// `StatusChanged` come from the waiter and are queued before this
    /// returns.
    pub async fn stop(&self) {
        let waiter = {
            let mut state = self.inner.state.lock().await;
            let Some(run) = state.take() else {
                debug!("stop requested while idle");
                return;
            };
            info!(run_id = run.run_id, "stopping engine");
            self.inner.running.store(false, Ordering::SeqCst);
            run.teardown(Teardown::Stop).await
        };

        if let Some(waiter) = waiter {
            if let Err(err) = waiter.await {
                warn!(%err, "waiter task failed");
            }
        }
    }

    /// Stop the engine, then remove everything under the environment
    /// directory. Returns `true` only if every entry was removed.
    pub async fn delete(&self) -> bool {
        self.stop().await;
        match self.inner.current_env() {
            Some(env) => {
                let removed = env.delete_contents();
                info!(dir = %env.base_dir().display(), removed, "environment deleted");
                removed
            }
            None => {
                warn!("delete requested without an environment");
                false
            }
        }
    }

    /// Run the engine with `-v` and return the first line it prints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadEnvironment` if no environment is loaded,
    /// `AppError::Launch` if the executable cannot be run, and `AppError::Io`
    /// if it prints nothing.
    pub async fn query_version(&self) -> Result<String> {
        let env = self
            .inner
            .current_env()
            .ok_or_else(|| AppError::BadEnvironment("no environment loaded".into()))?;

        let output = Command::new(env.executable())
            .arg("-v")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                AppError::Launch(format!(
                    "failed to run {} -v: {err}",
                    env.executable().display()
                ))
            })?;

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| AppError::Io("version query produced no output".into()))
    }

    /// Stop the engine and drain the dispatcher. Events published afterwards
    /// are dropped.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.dispatcher.shutdown().await;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let token = self
            .inner
            .run_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }
}

// ── Spawning ─────────────────────────────────────────────────────────────────

fn engine_command(env: &Environment) -> Command {
    let mut command = Command::new(env.executable());
    command
        .args(env.flags().to_args())
        .current_dir(env.base_dir())
        .stdin(Stdio::null())
        .kill_on_drop(true);
    command
}

fn launch_error(env: &Environment, err: &std::io::Error) -> AppError {
    AppError::Launch(format!(
        "failed to spawn {}: {err}",
        env.executable().display()
    ))
}

fn spawn_engine(
    env: &Environment,
    merge_streams: bool,
) -> Result<(Child, EngineStream, Option<EngineStream>)> {
    if merge_streams {
        return spawn_merged(env);
    }
    spawn_separate(env)
}

fn spawn_separate(env: &Environment) -> Result<(Child, EngineStream, Option<EngineStream>)> {
    let mut child = engine_command(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| launch_error(env, &err))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Launch("engine stdout was not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Launch("engine stderr was not captured".into()))?;

    Ok((child, Box::new(stdout), Some(Box::new(stderr))))
}

#[cfg(unix)]
fn spawn_merged(env: &Environment) -> Result<(Child, EngineStream, Option<EngineStream>)> {
    use std::os::fd::OwnedFd;
    use tokio::net::unix::pipe;

    let pipe_error =
        |err: std::io::Error| AppError::Launch(format!("failed to create output pipe: {err}"));

    let (reader, writer) = std::io::pipe().map_err(pipe_error)?;
    let error_writer = writer.try_clone().map_err(pipe_error)?;

    let mut command = engine_command(env);
    command.stdout(writer).stderr(error_writer);
    let child = command.spawn().map_err(|err| launch_error(env, &err))?;
    // Our copies of the write end must close or the reader never sees EOF.
    drop(command);

    let receiver = pipe::Receiver::from_owned_fd(OwnedFd::from(reader)).map_err(pipe_error)?;
    Ok((child, Box::new(receiver), None))
}

#[cfg(not(unix))]
fn spawn_merged(env: &Environment) -> Result<(Child, EngineStream, Option<EngineStream>)> {
    warn!("merged output streams are unsupported on this platform, watching them separately");
    spawn_separate(env)
}

// ── Waiter ───────────────────────────────────────────────────────────────────

async fn wait_for_exit(inner: Arc<Inner>, run_id: u64, mut child: Child, kill: CancellationToken) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            debug!(run_id, "killing engine");
            if let Err(err) = child.start_kill() {
                warn!(run_id, %err, "failed to signal engine");
            }
            child.wait().await
        }
    };

    let exit_code = match status {
        Ok(status) => exit_code(status),
        Err(err) => {
            error!(run_id, %err, "waiting on engine failed");
            ABNORMAL_EXIT_CODE
        }
    };

    inner.finish_run(run_id).await;

    info!(run_id, exit_code, "engine exited");
    inner.events.publish(Event::ProcessTerminated { exit_code });
    inner.events.publish(Event::StatusChanged { running: false });
}

/// Exit code of a finished child; `128 + signal` for signal deaths on Unix.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    ABNORMAL_EXIT_CODE
}
