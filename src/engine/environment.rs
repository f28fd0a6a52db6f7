//! On-disk environment of the engine and its launch flags.
//!
//! [`Environment::load`] validates the layout (a directory containing the
//! `aria2c` executable, plus a usable session file) and derives the ordered
//! flag set from [`EngineSettings`]. The flags are built in three layers:
//!
//! 1. overridable defaults (`--check-certificate`, `--save-session-interval`),
//! 2. the user's custom options,
//! 3. operational flags the supervisor depends on (`--daemon=false`, RPC
//!    settings, `--dir`, session files). These always win.
//!
//! A custom option that collides with an operational flag is overridden and a
//! warning names it.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::EngineSettings;
use crate::{AppError, Result};

/// File name of the engine executable inside the environment directory.
#[cfg(windows)]
pub const EXECUTABLE_NAME: &str = "aria2c.exe";

/// File name of the engine executable inside the environment directory.
#[cfg(not(windows))]
pub const EXECUTABLE_NAME: &str = "aria2c";

/// Flags whose values must not appear in logs.
const SECRET_FLAGS: &[&str] = &["--rpc-secret"];

// ── Launch flags ─────────────────────────────────────────────────────────────

/// Ordered flag map. Setting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchFlags {
    entries: Vec<(String, Option<String>)>,
}

impl LaunchFlags {
    /// Empty flag set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, returning the previous value if the key existed.
    pub fn set(&mut self, key: impl Into<String>, value: Option<String>) -> Option<Option<String>> {
        let key = key.into();
        if let Some((_, slot)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(slot, value));
        }
        self.entries.push((key, value));
        None
    }

    /// Value of `key`; `Some(None)` for a bare flag.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.as_deref())
    }

    /// Flags in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_deref()))
    }

    /// Number of flags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no flags are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render as argv entries: `--key` when the value is absent or empty,
    /// `--key=value` otherwise.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        self.iter()
            .map(|(key, value)| match value {
                Some(value) if !value.is_empty() => format!("{key}={value}"),
                _ => key.to_owned(),
            })
            .collect()
    }
}

/// Normalize a custom option name to `--name`.
#[must_use]
pub fn normalize_flag(name: &str) -> String {
    format!("--{}", name.trim_start_matches('-'))
}

/// Build the full flag set for `settings`, with `session_file` used for
/// session persistence.
#[must_use]
pub fn build_flags(settings: &EngineSettings, session_file: &Path) -> LaunchFlags {
    let mut flags = LaunchFlags::new();

    // Overridable defaults.
    flags.set(
        "--check-certificate",
        Some(settings.check_certificate.to_string()),
    );
    if settings.save_session {
        flags.set(
            "--save-session-interval",
            Some(settings.save_session_interval.to_string()),
        );
    }

    // User options.
    let mut custom = HashSet::new();
    for (name, value) in &settings.custom_options {
        let key = normalize_flag(name);
        flags.set(key.clone(), Some(value.clone()));
        custom.insert(key);
    }

    // Operational flags.
    let session = session_file.display().to_string();
    let mut operational = vec![
        ("--daemon", Some("false".to_owned())),
        ("--enable-color", Some("false".to_owned())),
        ("--rpc-listen-all", Some("true".to_owned())),
        ("--enable-rpc", Some("true".to_owned())),
        ("--rpc-secret", Some(settings.rpc_token.clone())),
        ("--rpc-listen-port", Some(settings.rpc_port.to_string())),
        (
            "--dir",
            Some(settings.output_directory.display().to_string()),
        ),
    ];
    if settings.save_session {
        operational.push(("--input-file", Some(session.clone())));
        operational.push(("--save-session", Some(session)));
    }
    if settings.rpc_allow_origin_all {
        operational.push(("--rpc-allow-origin-all", Some("true".to_owned())));
    }

    for (key, value) in operational {
        let previous = flags.set(key, value.clone());
        if let Some(previous) = previous.filter(|prev| custom.contains(key) && *prev != value) {
            let (ignored, applied) = if SECRET_FLAGS.contains(&key) {
                ("<redacted>".to_owned(), "<redacted>".to_owned())
            } else {
                (previous.unwrap_or_default(), value.unwrap_or_default())
            };
            warn!(
                flag = key,
                ignored = %ignored,
                applied = %applied,
                "custom option overridden by operational flag"
            );
        }
    }

    flags
}

// ── Environment ──────────────────────────────────────────────────────────────

/// Validated engine layout plus the launch flags derived from settings.
#[derive(Debug, Clone)]
pub struct Environment {
    base_dir: PathBuf,
    executable: PathBuf,
    session_file: PathBuf,
    settings: EngineSettings,
    flags: LaunchFlags,
}

impl Environment {
    /// Validate `base_dir` and `session_file` and derive flags from `settings`.
    ///
    /// Sets the executable bit on the engine binary and creates a missing
    /// session file if needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadEnvironment` if `base_dir` is not a directory,
    /// the executable is missing or cannot be made executable, or the session
    /// file can neither be read nor created.
    pub fn load(base_dir: &Path, session_file: &Path, settings: EngineSettings) -> Result<Self> {
        if !base_dir.is_dir() {
            return Err(AppError::BadEnvironment(format!(
                "{} is not a directory",
                base_dir.display()
            )));
        }

        let executable = base_dir.join(EXECUTABLE_NAME);
        if !executable.exists() {
            return Err(AppError::BadEnvironment(format!(
                "{} doesn't exist",
                executable.display()
            )));
        }
        ensure_executable(&executable)?;
        ensure_session_file(session_file)?;

        let executable = canonical(&executable)?;
        let session_file = canonical(session_file)?;
        let flags = build_flags(&settings, &session_file);

        debug!(
            executable = %executable.display(),
            flags = flags.len(),
            "environment resolved"
        );

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            executable,
            session_file,
            settings,
            flags,
        })
    }

    /// Environment directory as given to [`load`](Self::load).
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Absolute path of the engine executable.
    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Absolute path of the session file.
    #[must_use]
    pub fn session_file(&self) -> &Path {
        &self.session_file
    }

    /// Settings the flags were derived from.
    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Derived launch flags.
    #[must_use]
    pub fn flags(&self) -> &LaunchFlags {
        &self.flags
    }

    /// Full argv: executable followed by the rendered flags.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.flags.len() + 1);
        argv.push(self.executable.display().to_string());
        argv.extend(self.flags.to_args());
        argv
    }

    /// Space-joined argv, for the audit trail.
    #[must_use]
    pub fn command_line(&self) -> String {
        self.argv().join(" ")
    }

    /// Remove every entry under the environment directory; returns `true`
    /// only if all removals succeeded.
    #[must_use]
    pub fn delete_contents(&self) -> bool {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.base_dir.display(), %err, "cannot list environment directory");
                return false;
            }
        };

        let mut all_removed = true;
        for entry in entries {
            let removed = entry.and_then(|entry| {
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                }
            });
            if let Err(err) = removed {
                warn!(dir = %self.base_dir.display(), %err, "failed to remove environment entry");
                all_removed = false;
            }
        }
        all_removed
    }
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|err| {
        AppError::BadEnvironment(format!("{} cannot be resolved: {err}", path.display()))
    })
}

#[cfg(unix)]
fn ensure_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let cannot_execute =
        |err: std::io::Error| AppError::BadEnvironment(format!("{} can't be executed: {err}", path.display()));

    let mode = fs::metadata(path).map_err(cannot_execute)?.permissions().mode();
    if mode & 0o100 != 0 {
        return Ok(());
    }

    debug!(path = %path.display(), "setting executable bit");
    fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o100)).map_err(cannot_execute)
}

#[cfg(not(unix))]
fn ensure_executable(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(AppError::BadEnvironment(format!(
            "{} can't be executed",
            path.display()
        )))
    }
}

fn ensure_session_file(path: &Path) -> Result<()> {
    if path.exists() {
        return match File::open(path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => make_readable(path),
            Err(err) => Err(AppError::BadEnvironment(format!(
                "{} can't be read: {err}",
                path.display()
            ))),
        };
    }

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map(drop)
        .map_err(|err| {
            AppError::BadEnvironment(format!("{} can't be created: {err}", path.display()))
        })
}

#[cfg(unix)]
fn make_readable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let cannot_read =
        |err: std::io::Error| AppError::BadEnvironment(format!("{} can't be read: {err}", path.display()));

    let mode = fs::metadata(path).map_err(cannot_read)?.permissions().mode();
    fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o400)).map_err(cannot_read)?;
    File::open(path).map(drop).map_err(cannot_read)
}

#[cfg(not(unix))]
fn make_readable(path: &Path) -> Result<()> {
    Err(AppError::BadEnvironment(format!(
        "{} can't be read",
        path.display()
    )))
}
