//! The supervised engine: its on-disk environment and its process lifecycle.

pub mod environment;
pub mod supervisor;

pub use environment::{build_flags, Environment, LaunchFlags, EXECUTABLE_NAME};
pub use supervisor::{LaunchOptions, StartOutcome, Supervisor};
