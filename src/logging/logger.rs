// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logger handle and log sinks

use super::{Facility, Severity};
use std::sync::Arc;

/// Destination for formatted log lines.
pub trait LogSink: Send + Sync {
    fn write(&self, severity: Severity, facility: Facility, message: &str);
}

/// Sink writing one line per entry to standard error.
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write(&self, severity: Severity, facility: Facility, message: &str) {
        eprintln!("[{}] {}: {}", severity, facility, message);
    }
}

/// Sink that drops everything. Used by tests.
pub struct DiscardSink;

impl LogSink for DiscardSink {
    fn write(&self, _severity: Severity, _facility: Facility, _message: &str) {}
}

struct LoggerInner {
    sink: Box<dyn LogSink>,
    max_severity: Severity,
}

/// Logger handle for writing log entries
///
/// This is a lightweight handle that can be cloned and passed around.
/// The sink is shared via Arc.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl Logger {
    /// Create a logger over a sink, discarding entries above `max_severity`.
    pub fn new(sink: Box<dyn LogSink>, max_severity: Severity) -> Self {
        Self {
            inner: Arc::new(LoggerInner { sink, max_severity }),
        }
    }

    /// Stderr logger with the severity cut-off derived from `-v` count.
    pub fn stderr(verbosity: u8) -> Self {
        Self::new(Box::new(StderrSink), Severity::from_verbosity(verbosity))
    }

    /// Logger for tests: everything is discarded.
    pub fn discard() -> Self {
        Self::new(Box::new(DiscardSink), Severity::Emergency)
    }

    /// Whether a message of this severity would be emitted.
    #[inline]
    pub fn enabled(&self, severity: Severity) -> bool {
        severity <= self.inner.max_severity
    }

    /// Write a log entry
    #[inline]
    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if self.enabled(severity) {
            self.inner.sink.write(severity, facility, message);
        }
    }

    /// Log with error severity
    #[inline]
    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    /// Log with warning severity
    #[inline]
    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    /// Log with notice severity
    #[inline]
    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    /// Log with info severity
    #[inline]
    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    /// Log with debug severity
    #[inline]
    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }
}
