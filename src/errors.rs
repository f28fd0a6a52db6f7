//! Error types shared across the supervisor.

use std::fmt::{Display, Formatter};

/// Shared supervisor result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Supervisor error enumeration covering all failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Environment missing or invalid (no executable, unusable session file, …).
    BadEnvironment(String),
    /// The operating system refused to spawn a process.
    Launch(String),
    /// The resource monitor could not run its listing command.
    Monitor(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::BadEnvironment(msg) => write!(f, "bad environment: {msg}"),
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::Monitor(msg) => write!(f, "monitor: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
