//! Turns one line of engine output into a typed [`Event`].
//!
//! A [`Classifier`] is an ordered list of [`LineRule`]s; the first rule that
//! accepts a line decides its event. The standard order is:
//!
//! 1. `WARNING: <text>` → [`Event::ProcessWarn`]
//! 2. `ERROR: <text>` → [`Event::ProcessError`]
//! 3. `MM/DD HH:MM:SS [tag] <text>` → [`Event::ProcessInfo`] with the tag dropped
//! 4. anything else → [`Event::ProcessInfo`] with the whole line
//!
//! Empty lines produce no event.

use std::fmt::Debug;
use std::sync::LazyLock;

use regex::Regex;

use crate::events::Event;

/// Timestamp-and-tag prefix of the engine's console log lines.
#[allow(clippy::expect_used)]
static INFO_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{2}/\d{2} \d{2}:\d{2}:\d{2} \[[^\]]+\] (.+)$")
        .expect("info prefix pattern is a valid literal")
});

/// One predicate-plus-extractor step of a [`Classifier`].
pub trait LineRule: Send + Sync + Debug {
    /// Return the event for `line`, or `None` to defer to the next rule.
    fn apply(&self, line: &str) -> Option<Event>;
}

/// Severity a [`PrefixRule`] maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// [`Event::ProcessInfo`].
    Info,
    /// [`Event::ProcessWarn`].
    Warn,
    /// [`Event::ProcessError`].
    Error,
}

impl Severity {
    fn event(self, text: String) -> Event {
        match self {
            Self::Info => Event::ProcessInfo { text },
            Self::Warn => Event::ProcessWarn { text },
            Self::Error => Event::ProcessError { text },
        }
    }
}

/// Matches a literal prefix and keeps the rest of the line.
#[derive(Debug, Clone)]
pub struct PrefixRule {
    prefix: &'static str,
    severity: Severity,
}

impl PrefixRule {
    /// Rule emitting `severity` for lines starting with `prefix`.
    #[must_use]
    pub const fn new(prefix: &'static str, severity: Severity) -> Self {
        Self { prefix, severity }
    }
}

impl LineRule for PrefixRule {
    fn apply(&self, line: &str) -> Option<Event> {
        line.strip_prefix(self.prefix)
            .map(|rest| self.severity.event(rest.to_owned()))
    }
}

/// Strips the `MM/DD HH:MM:SS [tag] ` prefix of an info line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampedInfoRule;

impl LineRule for TimestampedInfoRule {
    fn apply(&self, line: &str) -> Option<Event> {
        INFO_PREFIX
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|message| Event::ProcessInfo {
                text: message.as_str().to_owned(),
            })
    }
}

/// Accepts every line as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerbatimRule;

impl LineRule for VerbatimRule {
    fn apply(&self, line: &str) -> Option<Event> {
        Some(Event::ProcessInfo {
            text: line.to_owned(),
        })
    }
}

/// Ordered rule list; first match wins.
#[derive(Debug)]
pub struct Classifier {
    rules: Vec<Box<dyn LineRule>>,
}

impl Classifier {
    /// Classifier with a custom rule order.
    #[must_use]
    pub fn new(rules: Vec<Box<dyn LineRule>>) -> Self {
        Self { rules }
    }

    /// The engine's standard rules.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(PrefixRule::new("WARNING: ", Severity::Warn)),
            Box::new(PrefixRule::new("ERROR: ", Severity::Error)),
            Box::new(TimestampedInfoRule),
            Box::new(VerbatimRule),
        ])
    }

    /// Classify one line. Empty lines, and lines no rule accepts, yield `None`.
    #[must_use]
    pub fn classify(&self, line: &str) -> Option<Event> {
        if line.is_empty() {
            return None;
        }
        self.rules.iter().find_map(|rule| rule.apply(line))
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::standard()
    }
}
