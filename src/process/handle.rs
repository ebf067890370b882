//! Handle to one spawned subprocess

use crate::error::{DockrunError, DockrunResult};
use crate::process::lines::{LogEntry, Origin, OutputVars};
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

/// Output accumulated while a process runs
#[derive(Debug, Default)]
pub(crate) struct Capture {
    pub(crate) log: Vec<LogEntry>,
    pub(crate) vars: OutputVars,
}

pub(crate) type SharedCapture = Arc<Mutex<Capture>>;

pub(crate) fn lock(capture: &SharedCapture) -> MutexGuard<'_, Capture> {
    capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A running or finished subprocess.
///
/// The child is owned by a background task that consumes both output
/// streams and reaps it, so the process always reaches a terminal state even
/// if the handle is dropped without waiting.
pub struct ProcessHandle {
    command: String,
    pid: Option<u32>,
    capture: SharedCapture,
    reaped: Arc<AtomicBool>,
    task: Option<JoinHandle<io::Result<Option<i32>>>>,
    exit: Option<Option<i32>>,
}

impl ProcessHandle {
    pub(crate) fn new(
        command: String,
        pid: Option<u32>,
        capture: SharedCapture,
        reaped: Arc<AtomicBool>,
        task: JoinHandle<io::Result<Option<i32>>>,
    ) -> Self {
        Self {
            command,
            pid,
            capture,
            reaped,
            task: Some(task),
            exit: None,
        }
    }

    /// The command line this handle was spawned with
    pub fn command(&self) -> &str {
        &self.command
    }

    /// OS process id, if the process was still alive right after spawn
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the process to finish.
    ///
    /// Resolves only after both output streams are drained. Returns `None`
    /// when the process was terminated by a signal (including cancellation).
    pub async fn wait(&mut self) -> DockrunResult<Option<i32>> {
        if let Some(code) = self.exit {
            return Ok(code);
        }

        let task = self
            .task
            .take()
            .ok_or_else(|| DockrunError::Internal(format!("{} has no driver task", self.command)))?;
        let code = task
            .await
            .map_err(|e| DockrunError::Internal(format!("process driver for {}: {e}", self.command)))?
            .map_err(|e| DockrunError::io(format!("waiting for {}", self.command), e))?;

        debug!("{} exited with {:?}", self.command, code);
        self.exit = Some(code);
        Ok(code)
    }

    /// Exit code if `wait` already completed
    pub fn exit_code(&self) -> Option<Option<i32>> {
        self.exit
    }

    /// Send a signal (SIGTERM by default) to the process group.
    ///
    /// Does nothing once the process has been reaped and never fails.
    pub fn kill(&self, signal: Option<i32>) {
        if self.reaped.load(Ordering::SeqCst) {
            return;
        }
        if let Some(pid) = self.pid {
            super::signal_group(pid, signal.unwrap_or(libc::SIGTERM));
        }
    }

    /// Chronological log of non-variable output lines
    pub fn log(&self) -> Vec<LogEntry> {
        lock(&self.capture).log.clone()
    }

    /// Captured output variables
    pub fn vars(&self) -> OutputVars {
        lock(&self.capture).vars.clone()
    }

    /// One captured output variable
    pub fn var(&self, name: &str) -> Option<Value> {
        lock(&self.capture).vars.get(name).cloned()
    }

    /// Text of all logged stdout lines
    pub fn stdout_lines(&self) -> Vec<String> {
        self.lines_from(Origin::Stdout)
    }

    /// Text of all logged stderr lines
    pub fn stderr_lines(&self) -> Vec<String> {
        self.lines_from(Origin::Stderr)
    }

    fn lines_from(&self, origin: Origin) -> Vec<String> {
        lock(&self.capture)
            .log
            .iter()
            .filter(|entry| entry.origin == origin)
            .map(|entry| entry.text.clone())
            .collect()
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("command", &self.command)
            .field("pid", &self.pid)
            .field("exit", &self.exit)
            .finish()
    }
}
