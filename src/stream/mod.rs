//! Engine output handling: line framing, classification, and watcher tasks.

pub mod classifier;
pub mod codec;
pub mod watcher;

pub use classifier::Classifier;
pub use watcher::{spawn_watcher, StreamKind, WatcherHandle};
