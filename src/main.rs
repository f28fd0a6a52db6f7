#![forbid(unsafe_code)]

//! `aria2-supervisor`: host binary for the engine supervisor.
//!
//! Loads the host configuration, adopts the engine environment, and either
//! runs the engine until Ctrl-C/SIGTERM, prints its version, or wipes the
//! environment directory.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use aria2_supervisor::dispatch::listeners::{JsonLinesListener, TracingListener};
use aria2_supervisor::{
    AppError, LaunchOptions, Result, StartOutcome, Supervisor, SupervisorConfig, TomlSettingsFile,
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum EventFormat {
    /// Log events through tracing.
    Text,
    /// Write one JSON wire message per event to stdout.
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "aria2-supervisor", about = "Supervise an aria2c download engine", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch the engine and relay its events until interrupted.
    Run {
        /// How events are reported.
        #[arg(long, value_enum, default_value_t = EventFormat::Text)]
        events: EventFormat,
    },
    /// Print the engine version.
    Version,
    /// Remove everything under the environment directory.
    Delete,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = SupervisorConfig::load_from_path(&args.config)?;
    info!(config = %args.config.display(), "configuration loaded");

    let options = LaunchOptions {
        merge_streams: config.merge_streams,
        listing_command: None,
    };
    let supervisor = Supervisor::new(Arc::new(TomlSettingsFile::new(&args.config)), options);
    supervisor.load_env(&config.env_dir, &config.session_file)?;

    let outcome = match args.command {
        Command::Run { events } => run_engine(&supervisor, events).await,
        Command::Version => supervisor.query_version().await.map(|version| {
            println!("{version}");
        }),
        Command::Delete => {
            if supervisor.delete().await {
                Ok(())
            } else {
                Err(AppError::Io(format!(
                    "could not remove every entry under {}",
                    config.env_dir.display()
                )))
            }
        }
    };

    supervisor.shutdown().await;
    outcome
}

async fn run_engine(supervisor: &Supervisor, events: EventFormat) -> Result<()> {
    let _listener = match events {
        EventFormat::Text => supervisor.subscribe(TracingListener),
        EventFormat::Json => supervisor.subscribe(JsonLinesListener::new(std::io::stdout())),
    };

    match supervisor.start().await? {
        StartOutcome::Started => info!("engine running, waiting for shutdown signal"),
        StartOutcome::AlreadyRunning => info!("engine already running"),
        StartOutcome::LaunchFailed => {
            return Err(AppError::Launch("engine could not be spawned".into()));
        }
    }

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    supervisor.stop().await;
    info!("aria2-supervisor shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                if let Err(err) = ctrl_c.await {
                    error!(%err, "ctrl-c signal handler failed");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stdout may carry JSON events; keep logs on stderr.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
