//! Supervisor configuration parsing, validation, and the engine settings source.
//!
//! Two layers live here:
//!
//! - [`SupervisorConfig`]: the host-level TOML file (environment location,
//!   session file, stream handling) read once by the binary.
//! - [`EngineSettings`]: the persisted key-value options that shape the
//!   engine's command line. These are read through a [`SettingsSource`] on
//!   every environment load, so edits made between runs take effect on the
//!   next `start()`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::Deserialize;

use crate::{AppError, Result};

fn default_true() -> bool {
    true
}

fn default_save_session_interval() -> u32 {
    30
}

fn default_rpc_port() -> u16 {
    6800
}

fn default_performance_interval() -> u64 {
    1
}

/// Persisted engine options read at launch time.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineSettings {
    /// Directory the engine downloads into (`--dir`).
    pub output_directory: PathBuf,
    /// Persist the download session to the session file.
    #[serde(default = "default_true")]
    pub save_session: bool,
    /// Seconds between session saves when `save_session` is on.
    #[serde(default = "default_save_session_interval")]
    pub save_session_interval: u32,
    /// Verify TLS certificates of remote peers.
    #[serde(default)]
    pub check_certificate: bool,
    /// Shared secret for the engine's RPC interface.
    #[serde(default)]
    pub rpc_token: String,
    /// Port the engine's RPC interface listens on.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// Answer RPC requests from any origin.
    #[serde(default)]
    pub rpc_allow_origin_all: bool,
    /// Run the resource monitor alongside the engine.
    #[serde(default)]
    pub show_performance: bool,
    /// Resource monitor poll period.
    #[serde(default = "default_performance_interval")]
    pub performance_interval_seconds: u64,
    /// Arbitrary extra engine flags, keyed by flag name without dashes.
    #[serde(default)]
    pub custom_options: BTreeMap<String, String>,
}

impl EngineSettings {
    /// Settings with every option at its default and the given output directory.
    #[must_use]
    pub fn new(output_directory: impl Into<PathBuf>) -> Self {
        Self {
            output_directory: output_directory.into(),
            save_session: default_true(),
            save_session_interval: default_save_session_interval(),
            check_certificate: false,
            rpc_token: String::new(),
            rpc_port: default_rpc_port(),
            rpc_allow_origin_all: false,
            show_performance: false,
            performance_interval_seconds: default_performance_interval(),
            custom_options: BTreeMap::new(),
        }
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.rpc_port == 0 {
            return Err(AppError::Config("rpc_port must be greater than zero".into()));
        }

        if self.save_session_interval == 0 {
            return Err(AppError::Config(
                "save_session_interval must be at least one second".into(),
            ));
        }

        if self.performance_interval_seconds == 0 {
            return Err(AppError::Config(
                "performance_interval_seconds must be at least one second".into(),
            ));
        }

        Ok(())
    }
}

/// Host configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Directory holding the engine executable; owned by the supervisor.
    pub env_dir: PathBuf,
    /// Session file handed to the engine for session persistence.
    pub session_file: PathBuf,
    /// Route the engine's stderr into its stdout pipe.
    #[serde(default)]
    pub merge_streams: bool,
    /// Engine options.
    pub engine: EngineSettings,
}

impl SupervisorConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.engine.validate()?;
        Ok(config)
    }
}

// ── Settings sources ─────────────────────────────────────────────────────────

/// Where the supervisor reads [`EngineSettings`] from.
///
/// Called on every environment load, including the implicit reload that
/// precedes each `start()`.
pub trait SettingsSource: Send + Sync {
    /// Read the current settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when the settings cannot be read or are invalid.
    fn load(&self) -> Result<EngineSettings>;
}

/// Re-reads the `[engine]` table of a TOML file on every load.
#[derive(Debug, Clone)]
pub struct TomlSettingsFile {
    path: PathBuf,
}

#[derive(Deserialize)]
struct EngineTable {
    engine: EngineSettings,
}

impl TomlSettingsFile {
    /// Source backed by the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsSource for TomlSettingsFile {
    fn load(&self) -> Result<EngineSettings> {
        let raw = fs::read_to_string(&self.path).map_err(|err| {
            AppError::Config(format!(
                "failed to read settings from {}: {err}",
                self.path.display()
            ))
        })?;
        let table: EngineTable = toml::from_str(&raw)?;
        table.engine.validate()?;
        Ok(table.engine)
    }
}

/// Mutable in-memory settings, for embedders that persist options themselves.
#[derive(Debug)]
pub struct MemorySettings {
    inner: RwLock<EngineSettings>,
}

impl MemorySettings {
    /// Wrap an initial settings value.
    #[must_use]
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    /// Apply an edit; takes effect at the next environment load.
    pub fn update(&self, edit: impl FnOnce(&mut EngineSettings)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        edit(&mut guard);
    }
}

impl SettingsSource for MemorySettings {
    fn load(&self) -> Result<EngineSettings> {
        let settings = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        settings.validate()?;
        Ok(settings)
    }
}
