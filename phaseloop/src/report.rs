//! Operator-facing progress reporting.
//!
//! The workflow never prints directly. It is handed a [`Reporter`] at
//! construction, so tests can capture output per instance and the binary can
//! decide where lines go.

use std::io::Write;

use tracing::debug;

/// Severity of a progress line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warn,
    Error,
}

impl Level {
    pub fn label(self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Success => "ok",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

/// Sink for human-readable progress lines.
///
/// Implementations must be shareable with the heartbeat thread.
pub trait Reporter: Send + Sync {
    fn report(&self, level: Level, message: &str);

    fn info(&self, message: &str) {
        self.report(Level::Info, message);
    }

    fn success(&self, message: &str) {
        self.report(Level::Success, message);
    }

    fn warn(&self, message: &str) {
        self.report(Level::Warn, message);
    }

    fn error(&self, message: &str) {
        self.report(Level::Error, message);
    }
}

/// Writes `[phaseloop] <level>: <message>` lines to stderr.
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn report(&self, level: Level, message: &str) {
        debug!(level = level.label(), message, "report");
        let mut stderr = std::io::stderr().lock();
        // A closed stderr must not take the run down with it.
        let _ = writeln!(stderr, "[phaseloop] {}: {message}", level.label());
    }
}

/// Discards everything. Used by `phaseloop status` and embedders.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&self, _level: Level, _message: &str) {}
}
