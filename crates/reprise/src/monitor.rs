//! Crash-safe cleanup of on-disk cache artifacts.
//!
//! A [`CleanupMonitor`] waits for the server process to end, however it ends,
//! and then deletes the cache directory (or just the cache's blobs) exactly
//! once. In production it runs inside a helper process started by
//! [`ProcessMonitorSpawner`], so it keeps running after the server has died.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::mpsc;
use std::time::Duration;

use thiserror::Error;

use crate::resource::OnDiskResourceCache;

/// How often the monitor checks whether its parent is still alive.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Name of the hidden subcommand that runs a monitor in a helper process.
pub const MONITOR_SUBCOMMAND: &str = "cleanup-monitor";

/// Errors from starting a monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The helper process or thread could not be started.
    #[error("failed to spawn cleanup monitor: {0}")]
    Spawn(#[from] std::io::Error),
    /// Unknown deletion mode string.
    #[error("unknown cleanup mode: {0}")]
    UnknownMode(String),
}

/// What the monitor deletes once the parent is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Delete every file and directory under the path, then the path itself.
    RemoveTree,
    /// Delete only the on-disk cache's own blob files.
    CacheTeardown,
}

impl CleanupMode {
    /// Stable name used on the helper's command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RemoveTree => "remove-tree",
            Self::CacheTeardown => "cache-teardown",
        }
    }
}

impl fmt::Display for CleanupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CleanupMode {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remove-tree" => Ok(Self::RemoveTree),
            "cache-teardown" => Ok(Self::CacheTeardown),
            other => Err(MonitorError::UnknownMode(other.to_string())),
        }
    }
}

/// Probe telling the monitor whether its parent is still running.
pub trait Liveness: Send {
    /// `true` while the parent is alive.
    fn is_alive(&mut self) -> bool;
}

/// Liveness of an OS process, probed with signal 0.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLiveness {
    pid: u32,
}

impl ProcessLiveness {
    /// Watch the process with the given id.
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

impl Liveness for ProcessLiveness {
    #[cfg(unix)]
    fn is_alive(&mut self) -> bool {
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            return false;
        };
        // SAFETY: signal 0 performs the existence and permission checks only.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_alive(&mut self) -> bool {
        true
    }
}

/// Liveness tied to a [`ParentToken`]: alive until the token is dropped.
#[derive(Debug)]
pub struct TokenLiveness {
    rx: mpsc::Receiver<()>,
}

/// Held by the parent; dropping it signals the parent has finished.
#[derive(Debug)]
pub struct ParentToken {
    _tx: mpsc::Sender<()>,
}

impl TokenLiveness {
    /// Create a linked token/probe pair.
    pub fn pair() -> (ParentToken, Self) {
        let (tx, rx) = mpsc::channel();
        (ParentToken { _tx: tx }, Self { rx })
    }
}

impl Liveness for TokenLiveness {
    fn is_alive(&mut self) -> bool {
        !matches!(self.rx.try_recv(), Err(mpsc::TryRecvError::Disconnected))
    }
}

/// Totals from a deletion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Files removed.
    pub files_removed: usize,
    /// Directories removed.
    pub dirs_removed: usize,
    /// Entries that could not be removed.
    pub failures: usize,
}

/// Deletes a cache directory once its parent process is gone.
#[derive(Debug, Clone)]
pub struct CleanupMonitor {
    path: PathBuf,
    mode: CleanupMode,
    interval: Duration,
}

impl CleanupMonitor {
    /// Monitor `path` with the default poll interval.
    pub fn new(path: impl Into<PathBuf>, mode: CleanupMode) -> Self {
        Self {
            path: path.into(),
            mode,
            interval: POLL_INTERVAL,
        }
    }

    /// Override the poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Directory being watched.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletion mode.
    pub fn mode(&self) -> CleanupMode {
        self.mode
    }

    /// Block until the parent dies, then delete once.
    ///
    /// Consumes the monitor so the deletion pass cannot run twice.
    pub fn run(self, liveness: &mut dyn Liveness) -> CleanupReport {
        while liveness.is_alive() {
            std::thread::sleep(self.interval);
        }

        tracing::info!(path = %self.path.display(), mode = %self.mode, "parent exited, cleaning up cache");
        if !self.path.is_dir() {
            return CleanupReport::default();
        }

        match self.mode {
            CleanupMode::RemoveTree => {
                let mut report = CleanupReport::default();
                remove_tree(&self.path, &mut report);
                report
            }
            CleanupMode::CacheTeardown => match OnDiskResourceCache::teardown(&self.path) {
                Ok(files_removed) => CleanupReport {
                    files_removed,
                    ..CleanupReport::default()
                },
                Err(e) => {
                    tracing::warn!(error = %e, "cache teardown failed");
                    CleanupReport {
                        failures: 1,
                        ..CleanupReport::default()
                    }
                }
            },
        }
    }
}

/// Depth-first removal: a directory's contents go before the directory.
fn remove_tree(dir: &Path, report: &mut CleanupReport) {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let path = entry.path();
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if is_dir {
                    remove_tree(&path, report);
                } else if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove file");
                    report.failures += 1;
                } else {
                    report.files_removed += 1;
                }
            }
        }
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "failed to list directory");
            report.failures += 1;
        }
    }

    match std::fs::remove_dir(dir) {
        Ok(()) => report.dirs_removed += 1,
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "failed to remove directory");
            report.failures += 1;
        }
    }
}

/// Starts a detached cleanup monitor.
pub trait MonitorSpawner: Send + Sync {
    /// Launch `monitor`; it must not be joined by the caller.
    fn spawn(&self, monitor: CleanupMonitor) -> Result<(), MonitorError>;
}

/// Runs the monitor in a helper process watching the current process.
///
/// The helper is `program cleanup-monitor --parent-pid <pid> --path <dir>
/// --mode <mode>`, started in its own process group so terminal signals
/// aimed at the server do not reach it.
#[derive(Debug, Clone)]
pub struct ProcessMonitorSpawner {
    program: PathBuf,
    parent_pid: u32,
}

impl ProcessMonitorSpawner {
    /// Spawn helpers by re-executing `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            parent_pid: std::process::id(),
        }
    }

    /// Spawn helpers by re-executing the running binary.
    pub fn current_exe() -> Result<Self, MonitorError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    fn command(&self, monitor: &CleanupMonitor) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(MONITOR_SUBCOMMAND)
            .arg("--parent-pid")
            .arg(self.parent_pid.to_string())
            .arg("--path")
            .arg(monitor.path())
            .arg("--mode")
            .arg(monitor.mode().as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

impl MonitorSpawner for ProcessMonitorSpawner {
    fn spawn(&self, monitor: CleanupMonitor) -> Result<(), MonitorError> {
        let mut child = self.command(&monitor).spawn()?;
        tracing::debug!(pid = child.id(), path = %monitor.path().display(), "cleanup monitor process started");
        // Reap the helper if it exits while we are still running.
        std::thread::Builder::new()
            .name("reprise-cleanup-reaper".to_string())
            .spawn(move || {
                let _ = child.wait();
            })?;
        Ok(())
    }
}

/// Runs the monitor on a detached thread.
///
/// Each spawn asks `liveness` for a fresh probe.
pub struct ThreadMonitorSpawner<F> {
    liveness: F,
}

impl<F> fmt::Debug for ThreadMonitorSpawner<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadMonitorSpawner").finish_non_exhaustive()
    }
}

impl<F> ThreadMonitorSpawner<F>
where
    F: Fn() -> Box<dyn Liveness> + Send + Sync,
{
    /// Create a spawner using `liveness` to build each probe.
    pub fn new(liveness: F) -> Self {
        Self { liveness }
    }
}

impl<F> MonitorSpawner for ThreadMonitorSpawner<F>
where
    F: Fn() -> Box<dyn Liveness> + Send + Sync,
{
    fn spawn(&self, monitor: CleanupMonitor) -> Result<(), MonitorError> {
        let mut probe = (self.liveness)();
        std::thread::Builder::new()
            .name("reprise-cleanup".to_string())
            .spawn(move || {
                let report = monitor.run(probe.as_mut());
                tracing::debug!(?report, "cleanup monitor finished");
            })?;
        Ok(())
    }
}
