#![forbid(unsafe_code)]

//! Supervisor for a long-lived `aria2c` download engine.
//!
//! The crate launches the engine with a flag set derived from persisted
//! settings, classifies its output into typed events, optionally samples its
//! CPU and memory use, and fans every event out to registered listeners in a
//! single global order.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod events;
pub mod monitor;
pub mod stream;

pub use config::{EngineSettings, MemorySettings, SettingsSource, SupervisorConfig, TomlSettingsFile};
pub use engine::{LaunchOptions, StartOutcome, Supervisor};
pub use errors::{AppError, Result};
pub use events::Event;
