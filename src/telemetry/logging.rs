//! Structured log sink
//!
//! A [`LogSink`] accepts a level, a message and an ordered set of key/value
//! [`Attributes`]. The production sink forwards to `tracing`; the memory
//! sink keeps every entry so tests can assert on what was logged.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};

// ============================================================================
// Levels and Attributes
// ============================================================================

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Ordered key/value pairs attached to a log event.
///
/// Keys are unique: inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl fmt::Display) {
        let key = key.into();
        let value = value.to_string();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Layer `self` over `defaults`: defaults first, event attributes win.
    pub fn merged_over(&self, defaults: &Attributes) -> Attributes {
        let mut merged = defaults.clone();
        for (k, v) in &self.0 {
            merged.insert(k.clone(), v);
        }
        merged
    }

    /// Render as a JSON object so structured log output keeps the pairs.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: fmt::Display> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (k, v) in iter {
            attrs.insert(k, v);
        }
        attrs
    }
}

// ============================================================================
// Sink Trait
// ============================================================================

/// Destination for leveled, structured log events.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, attributes: Attributes);

    fn debug(&self, message: &str, attributes: Attributes) {
        self.log(LogLevel::Debug, message, attributes);
    }

    fn info(&self, message: &str, attributes: Attributes) {
        self.log(LogLevel::Info, message, attributes);
    }

    fn warn(&self, message: &str, attributes: Attributes) {
        self.log(LogLevel::Warn, message, attributes);
    }

    fn error(&self, message: &str, attributes: Attributes) {
        self.log(LogLevel::Error, message, attributes);
    }
}

pub type SharedLogSink = Arc<dyn LogSink>;

// ============================================================================
// Tracing Sink
// ============================================================================

/// Forwards events to the global `tracing` subscriber.
///
/// Default attributes (e.g. `hostname`) are merged under every event so
/// logs from a fleet of instances can be told apart.
#[derive(Debug, Clone, Default)]
pub struct TracingLogSink {
    defaults: Attributes,
}

impl TracingLogSink {
    pub fn new(defaults: Attributes) -> Self {
        Self { defaults }
    }
}

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, message: &str, attributes: Attributes) {
        let attributes = attributes.merged_over(&self.defaults).to_json();
        match level {
            LogLevel::Debug => tracing::debug!(attributes = %attributes, "{}", message),
            LogLevel::Info => tracing::info!(attributes = %attributes, "{}", message),
            LogLevel::Warn => tracing::warn!(attributes = %attributes, "{}", message),
            LogLevel::Error => tracing::error!(attributes = %attributes, "{}", message),
        }
    }
}

// ============================================================================
// Memory Sink
// ============================================================================

/// A single recorded log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub attributes: Attributes,
}

/// Keeps every event in memory. Used by tests and by nothing else.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Entries whose message equals `message`.
    pub fn find(&self, message: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.message == message)
            .collect()
    }
}

impl LogSink for MemoryLogSink {
    fn log(&self, level: LogLevel, message: &str, attributes: Attributes) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(LogEntry {
                level,
                message: message.to_string(),
                attributes,
            });
    }
}

// ============================================================================
// Tests
// ============================================================================
