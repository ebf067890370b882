//! Subprocess runner
//!
//! Spawns an external command, classifies its output line by line and
//! exposes the result through a [`ProcessHandle`]. Children run in their own
//! process group so that forced termination also reaches anything they
//! started.

mod handle;
pub mod lines;

pub use handle::ProcessHandle;
pub use lines::{Classified, LineClassifier, LogEntry, Origin, OutputVars};

use crate::config::schema::DEFAULT_MARKER;
use crate::error::{DockrunError, DockrunResult};
use console::style;
use handle::{lock, Capture, SharedCapture};
use lines::LineReader;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long output is still read after a cancelled process exits
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Callback invoked for every non-variable output line
pub type LineHandler = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// Options for [`spawn`]
#[derive(Clone)]
pub struct SpawnOptions {
    /// Prefix marking a stdout line as a captured variable
    pub marker: String,
    /// Do not echo output to the console
    pub silent: bool,
    /// Echo prefix, defaults to the program's file name
    pub label: Option<String>,
    /// Extra environment for the spawned process
    pub env: HashMap<String, String>,
    /// Working directory for the spawned process
    pub cwd: Option<PathBuf>,
    /// Kills the process when cancelled
    pub cancel: Option<CancellationToken>,
    /// Receives every logged line
    pub on_line: Option<LineHandler>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
            silent: false,
            label: None,
            env: HashMap::new(),
            cwd: None,
            cancel: None,
            on_line: None,
        }
    }
}

impl SpawnOptions {
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }
}

/// Start `program` with `args` and begin consuming its output.
///
/// Must be called from within a tokio runtime. Fails immediately if the
/// executable cannot be started.
pub fn spawn<I, S>(program: &str, args: I, options: SpawnOptions) -> DockrunResult<ProcessHandle>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let command_line = render_command(program, &args);
    debug!("Executing: {}", command_line);

    let mut command = Command::new(program);
    command
        .args(&args)
        .envs(&options.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| DockrunError::spawn(&command_line, e))?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| DockrunError::Internal("stdout not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| DockrunError::Internal("stderr not piped".to_string()))?;

    let capture: SharedCapture = Arc::new(Mutex::new(Capture::default()));
    let reaped = Arc::new(AtomicBool::new(false));
    let router = LineRouter {
        classifier: LineClassifier::new(options.marker),
        capture: capture.clone(),
        label: options.label.unwrap_or_else(|| program_label(program)),
        silent: options.silent,
        on_line: options.on_line,
    };

    let task = tokio::spawn(drive(
        child,
        pid,
        OutputStreams::new(stdout, stderr),
        router,
        options.cancel,
        reaped.clone(),
    ));

    Ok(ProcessHandle::new(command_line, pid, capture, reaped, task))
}

/// Run `program` to completion on the calling thread, discarding output.
///
/// For cleanup paths that cannot await, such as signal hooks.
pub fn spawn_sync<I, S>(program: &str, args: I) -> DockrunResult<Option<i32>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let command_line = render_command(program, &args);
    debug!("Executing synchronously: {}", command_line);

    let status = std::process::Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| DockrunError::spawn(&command_line, e))?;

    Ok(status.code())
}

/// Owns the child until it exits and its output is consumed.
async fn drive(
    mut child: Child,
    pid: Option<u32>,
    mut streams: OutputStreams,
    router: LineRouter,
    cancel: Option<CancellationToken>,
    reaped: Arc<AtomicBool>,
) -> io::Result<Option<i32>> {
    let mut status: Option<Option<i32>> = None;
    let mut forced = false;

    loop {
        if let Some(code) = status {
            if forced && streams.is_open() {
                let drain = async {
                    while let Some((origin, line)) = streams.next().await {
                        router.accept(origin, line);
                    }
                };
                if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                    debug!("Abandoning remaining output of {}", router.label);
                }
            }
            if forced || !streams.is_open() {
                return Ok(code);
            }
        }

        tokio::select! {
            _ = cancelled(cancel.as_ref()), if !forced => {
                forced = true;
                if status.is_none() {
                    debug!("Cancellation requested, killing {}", router.label);
                    if let Some(pid) = pid {
                        signal_group(pid, libc::SIGKILL);
                    }
                    let _ = child.start_kill();
                }
            }
            next = streams.next(), if streams.is_open() => {
                if let Some((origin, line)) = next {
                    router.accept(origin, line);
                }
            }
            exit = child.wait(), if status.is_none() => {
                let exit = exit?;
                reaped.store(true, Ordering::SeqCst);
                status = Some(exit.code());
            }
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Both output pipes of a child, read concurrently
struct OutputStreams {
    stdout: LineReader<ChildStdout>,
    stderr: LineReader<ChildStderr>,
    stdout_open: bool,
    stderr_open: bool,
}

impl OutputStreams {
    fn new(stdout: ChildStdout, stderr: ChildStderr) -> Self {
        Self {
            stdout: LineReader::new(stdout),
            stderr: LineReader::new(stderr),
            stdout_open: true,
            stderr_open: true,
        }
    }

    fn is_open(&self) -> bool {
        self.stdout_open || self.stderr_open
    }

    /// Next line from whichever stream has one; `None` once both are closed
    async fn next(&mut self) -> Option<(Origin, String)> {
        while self.is_open() {
            tokio::select! {
                line = self.stdout.next_line(), if self.stdout_open => match line {
                    Ok(Some(line)) => return Some((Origin::Stdout, line)),
                    Ok(None) => self.stdout_open = false,
                    Err(e) => {
                        debug!("stdout read failed: {}", e);
                        self.stdout_open = false;
                    }
                },
                line = self.stderr.next_line(), if self.stderr_open => match line {
                    Ok(Some(line)) => return Some((Origin::Stderr, line)),
                    Ok(None) => self.stderr_open = false,
                    Err(e) => {
                        debug!("stderr read failed: {}", e);
                        self.stderr_open = false;
                    }
                },
            }
        }
        None
    }
}

/// Sends classified lines to the capture, the handler and the console
struct LineRouter {
    classifier: LineClassifier,
    capture: SharedCapture,
    label: String,
    silent: bool,
    on_line: Option<LineHandler>,
}

impl LineRouter {
    fn accept(&self, origin: Origin, text: String) {
        match self.classifier.classify(origin, text) {
            Classified::Var { name, value } => {
                debug!("Captured {} = {}", name, value);
                lock(&self.capture).vars.insert(name, value);
            }
            Classified::Entry(entry) => {
                if let Some(handler) = &self.on_line {
                    handler(&entry);
                }
                if !self.silent {
                    echo(&self.label, &entry);
                }
                lock(&self.capture).log.push(entry);
            }
        }
    }
}

fn echo(label: &str, entry: &LogEntry) {
    let prefix = format!("[{label}]");
    match entry.origin {
        Origin::Stdout => println!("{} {}", style(prefix).cyan().dim(), entry.text),
        Origin::Stderr => eprintln!("{} {}", style(prefix).red().dim(), entry.text),
    }
}

fn program_label(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

fn render_command(program: &str, args: &[OsString]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

/// Signal a whole process group, ignoring groups that are already gone
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: i32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and has no memory preconditions.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!("Failed to signal process group {}: {}", pid, err);
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pid: u32, _signal: i32) {}
