//! Entity status and bounded error history.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use crate::config::MAX_ERRORS;

/// Status shown for a machine, transfer or entropy source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    /// Nothing to report
    #[default]
    None,
    /// Working normally
    Success,
    /// Work in progress
    Pending,
    /// Recoverable problem
    Warning,
    /// Failure
    Error,
    /// Paused by the user
    Paused,
    /// Cancelled by the user
    Cancelled,
    /// Queued for retry
    Queued,
}

impl Status {
    /// Whether this status may still be set after a machine quits.
    #[must_use]
    pub fn survives_quit(&self) -> bool {
        matches!(self, Self::None | Self::Cancelled)
    }
}

/// Severity of a logged line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Informational
    Info,
    /// Warning
    Warning,
    /// Error
    Error,
}

/// One logged line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// When it was logged
    pub time: SystemTime,
    /// Severity
    pub severity: Severity,
    /// Text
    pub text: String,
}

/// Error history that evicts its oldest entry past the cap. Every line is
/// also emitted through `tracing`.
#[derive(Debug)]
pub struct ErrorLog {
    name: String,
    cap: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl ErrorLog {
    /// History for `name` holding at most `cap` lines (capped at 1024).
    #[must_use]
    pub fn new(name: impl Into<String>, cap: usize) -> Self {
        Self {
            name: name.into(),
            cap: cap.min(MAX_ERRORS),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a line.
    pub fn log(&self, severity: Severity, text: impl Into<String>) {
        let text = text.into();
        match severity {
            Severity::Info => tracing::info!("[{}] {}", self.name, text),
            Severity::Warning => tracing::warn!("[{}] {}", self.name, text),
            Severity::Error => tracing::error!("[{}] {}", self.name, text),
        }
        if self.cap == 0 {
            return;
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.cap {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            time: SystemTime::now(),
            severity,
            text,
        });
    }

    /// Record an informational line.
    pub fn info(&self, text: impl Into<String>) {
        self.log(Severity::Info, text);
    }

    /// Record a warning.
    pub fn warn(&self, text: impl Into<String>) {
        self.log(Severity::Warning, text);
    }

    /// Record an error.
    pub fn error(&self, text: impl Into<String>) {
        self.log(Severity::Error, text);
    }

    /// Snapshot, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of stored lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all lines.
    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
