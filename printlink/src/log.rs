//! Human-facing progress log
//!
//! The lifecycle reports every phase ("Connecting to GATT server...") to a
//! [`LogSink`]. What the sink does with the lines is up to the front end.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Info,
    Error,
}

pub trait LogSink: Send + Sync {
    fn log(&self, kind: LogKind, message: &str);
}

/// Forwards log lines to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl LogSink for TracingLog {
    fn log(&self, kind: LogKind, message: &str) {
        match kind {
            LogKind::Info => tracing::info!(target: "printlink", "{message}"),
            LogKind::Error => tracing::warn!(target: "printlink", "{message}"),
        }
    }
}

/// Keeps every line in memory, newest last
#[derive(Debug, Default, Clone)]
pub struct MemoryLog {
    lines: Arc<Mutex<Vec<(LogKind, String)>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(LogKind, String)> {
        self.lines.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.lines.lock().iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(kind, _)| *kind == LogKind::Error)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|(_, m)| m.contains(needle))
    }

    /// Remove and return everything logged so far
    pub fn drain(&self) -> Vec<(LogKind, String)> {
        std::mem::take(&mut *self.lines.lock())
    }
}

impl LogSink for MemoryLog {
    fn log(&self, kind: LogKind, message: &str) {
        self.lines.lock().push((kind, message.to_string()));
    }
}
