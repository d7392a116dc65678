//! Crash reporting.

use std::fmt;

use crate::request::SessionId;

/// A session ended because the shared context can no longer be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    /// Session that hit the failure.
    pub session: SessionId,
    /// What failed.
    pub reason: String,
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.session, self.reason)
    }
}

/// Process-wide crash report destination.
pub trait CrashSink: Send + Sync {
    /// Record a crash.
    fn report(&self, report: &CrashReport);
}

/// Crash sink writing reports to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCrashSink;

impl CrashSink for LogCrashSink {
    fn report(&self, report: &CrashReport) {
        tracing::error!(session = %report.session, reason = %report.reason, "replay session crashed");
    }
}
