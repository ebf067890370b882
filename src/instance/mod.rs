//! Container instance lifecycle
//!
//! An [`Instance`] owns one container named after a generated id and drives
//! it through the container CLI:
//!
//! | State | Reached by |
//! |-------|------------|
//! | Unbuilt | construction, failed build |
//! | Building | `init` with a build config and no usable cache |
//! | Built | successful build or cache hit |
//! | Running | `init` started the container |
//! | Stopped | `stop` |
//! | Killed | `kill` |
//!
//! The container is also killed when a registered cleanup hook fires or the
//! instance's cancellation token is cancelled.

mod cleanup;
mod image;

pub use cleanup::{CleanupHook, CleanupHooks, CleanupRegistry, HookId};
pub use image::ImageRef;

use crate::build::{BuildConfig, BuildPlan};
use crate::config::schema::ToolConfig;
use crate::config::Config;
use crate::error::{DockrunError, DockrunResult};
use crate::process::{self, LineHandler, ProcessHandle, SpawnOptions};
use indexmap::IndexMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Unbuilt,
    Building,
    Built,
    Running,
    Stopped,
    Killed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unbuilt => "unbuilt",
            Self::Building => "building",
            Self::Built => "built",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Killed => "killed",
        };
        f.write_str(name)
    }
}

/// Per-instance overrides of the configured defaults
#[derive(Clone, Default)]
pub struct InstanceOptions {
    /// Image to run when no build is configured
    pub image: Option<String>,
    /// Shell interpreting commands inside the container
    pub shell: Option<String>,
    /// Host directory mounted at the configured mount path
    pub workspace: Option<PathBuf>,
    /// Build the image before running it
    pub build: Option<BuildConfig>,
    /// Cancels in-flight subprocesses and kills the container
    pub cancel: Option<CancellationToken>,
    /// Do not echo subprocess output
    pub silent: bool,
}

/// Decides whether an exit code counts as success
pub type SuccessPredicate = Arc<dyn Fn(Option<i32>) -> bool + Send + Sync>;

/// Options for [`Instance::exec`]
#[derive(Clone, Default)]
pub struct ExecOptions {
    /// Marker prefix, defaults to the configured one
    pub marker: Option<String>,
    /// Overrides the instance's silent flag
    pub silent: Option<bool>,
    /// Echo label, defaults to the tool name
    pub label: Option<String>,
    /// Environment variables set inside the container
    pub env: IndexMap<String, String>,
    /// Working directory inside the container
    pub workdir: Option<String>,
    /// Cancels this exec; defaults to the instance token
    pub cancel: Option<CancellationToken>,
    /// Exit code check, defaults to [`default_success`]
    pub success: Option<SuccessPredicate>,
    /// Receives every logged line
    pub on_line: Option<LineHandler>,
}

/// Anything but a non-zero exit code is success; a signalled exec is not an error
pub fn default_success(code: Option<i32>) -> bool {
    !matches!(code, Some(code) if code != 0)
}

/// Synchronous `kill <id>`, shared with cleanup hooks and the cancel watcher.
///
/// Clones share one flag, so the tool's kill runs at most once per container.
#[derive(Clone)]
struct ContainerKiller {
    program: String,
    args: Vec<String>,
    killed: Arc<AtomicBool>,
}

impl ContainerKiller {
    fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            debug!("Container already killed: {}", self.args.join(" "));
            return;
        }
        match process::spawn_sync(&self.program, &self.args) {
            Ok(Some(0)) => debug!("Killed container: {}", self.args.join(" ")),
            Ok(code) => debug!(
                "{} {} exited with {:?}, container probably gone",
                self.program,
                self.args.join(" "),
                code
            ),
            Err(e) => warn!("Failed to kill container: {}", e),
        }
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// One disposable container session
pub struct Instance {
    id: String,
    tool: ToolConfig,
    shell: String,
    mount_path: String,
    idle_command: String,
    workspace: Option<PathBuf>,
    image: ImageRef,
    build: Option<BuildConfig>,
    cancel: Option<CancellationToken>,
    marker: String,
    silent: bool,
    verify_digest: bool,
    kill_on_drop: bool,
    state: InstanceState,
    killer: ContainerKiller,
    registry: Arc<dyn CleanupRegistry>,
    hook: Option<HookId>,
    watcher: Option<JoinHandle<()>>,
}

impl Instance {
    /// Create an instance and register its cleanup.
    ///
    /// Nothing is started until [`Instance::init`]. When a cancellation token
    /// is given and a tokio runtime is available, cancelling it kills the
    /// container.
    pub fn new(
        config: &Config,
        options: InstanceOptions,
        registry: Arc<dyn CleanupRegistry>,
    ) -> Self {
        let id = format!("dockrun-{}", Uuid::new_v4().simple());
        let killer = ContainerKiller {
            program: config.tool.program.clone(),
            args: config.tool.command_args(["kill", id.as_str()]),
            killed: Arc::new(AtomicBool::new(false)),
        };

        let hook_killer = killer.clone();
        let hook = registry.register(Box::new(move || hook_killer.kill()));

        let watcher = options.cancel.as_ref().and_then(|token| {
            let runtime = tokio::runtime::Handle::try_current().ok()?;
            let token = token.clone();
            let killer = killer.clone();
            Some(runtime.spawn(async move {
                token.cancelled().await;
                debug!("Instance cancelled, killing container");
                let _ = tokio::task::spawn_blocking(move || killer.kill()).await;
            }))
        });

        let image = options
            .image
            .unwrap_or_else(|| config.container.image.clone());
        debug!("Created instance {} (image {})", id, image);

        Self {
            id,
            tool: config.tool.clone(),
            shell: options
                .shell
                .unwrap_or_else(|| config.container.shell.clone()),
            mount_path: config.container.mount_path.clone(),
            idle_command: config.container.idle_command.clone(),
            workspace: options.workspace,
            image: ImageRef::Requested(image),
            build: options.build,
            cancel: options.cancel,
            marker: config.capture.marker.clone(),
            silent: options.silent,
            verify_digest: config.cache.verify_digest,
            kill_on_drop: config.container.kill_on_drop,
            state: InstanceState::Unbuilt,
            killer,
            registry,
            hook: Some(hook),
            watcher,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    /// Current state; `Killed` as soon as any cleanup path killed the container
    pub fn state(&self) -> InstanceState {
        if self.killer.is_killed() {
            InstanceState::Killed
        } else {
            self.state
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    /// Build the image if configured, then start the container.
    pub async fn init(&mut self) -> DockrunResult<()> {
        if !matches!(self.state(), InstanceState::Unbuilt | InstanceState::Built) {
            return Err(self.invalid("init"));
        }

        if !self.image.is_resolved() {
            let name = match self.build.clone() {
                Some(build) => self.build_image(&build).await?,
                None => self.image.name().to_string(),
            };
            self.image.resolve(name)?;
        }

        self.start().await
    }

    async fn build_image(&mut self, build: &BuildConfig) -> DockrunResult<String> {
        let plan = BuildPlan::prepare(build).await?;

        if plan.is_cached(self.verify_digest).await {
            info!(
                "Using cached image {} ({})",
                plan.image,
                plan.record_path.display()
            );
            self.state = InstanceState::Built;
            return Ok(plan.image);
        }

        self.state = InstanceState::Building;
        match self.run_build(&plan, build).await {
            Ok(()) => {
                self.state = InstanceState::Built;
                Ok(plan.image)
            }
            Err(e) => {
                self.state = InstanceState::Unbuilt;
                Err(e)
            }
        }
    }

    async fn run_build(&self, plan: &BuildPlan, build: &BuildConfig) -> DockrunResult<()> {
        info!("Building image {}", plan.image);

        let mut handle = self.spawn_tool(plan.command_args(build), self.tool_options())?;
        let code = handle.wait().await?;
        if code != Some(0) {
            return Err(DockrunError::BuildFailed {
                image: plan.image.clone(),
                code,
            });
        }

        plan.record(build).save(&plan.record_path).await?;
        debug!("Wrote cache record {}", plan.record_path.display());
        Ok(())
    }

    async fn start(&mut self) -> DockrunResult<()> {
        let mut handle = self.spawn_tool(self.run_args(), self.tool_options())?;
        let code = handle.wait().await?;

        if code != Some(0) {
            let stderr = handle.stderr_lines().join("\n");
            let reason = if stderr.is_empty() {
                format!("{} run exited with {:?}", self.tool.label(), code)
            } else {
                stderr
            };
            return Err(DockrunError::ContainerStart(reason));
        }

        info!("Container {} started from {}", self.id, self.image);
        self.state = InstanceState::Running;
        Ok(())
    }

    /// Arguments of the run subcommand
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string()];

        if let Some(workspace) = &self.workspace {
            let host = std::path::absolute(workspace).unwrap_or_else(|_| workspace.clone());
            args.push("-v".to_string());
            args.push(format!("{}:{}", host.display(), self.mount_path));
        }

        args.extend([
            "-w".to_string(),
            self.mount_path.clone(),
            "--rm".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.id.clone(),
            self.image.name().to_string(),
            self.shell.clone(),
            "-i".to_string(),
            "-c".to_string(),
            self.idle_command.clone(),
        ]);
        args
    }

    /// Run `command` through the shell inside the container.
    ///
    /// Returns the finished process handle; fails with
    /// [`DockrunError::ExecFailed`] when the success predicate rejects the
    /// exit code.
    pub async fn exec(&self, command: &str, options: ExecOptions) -> DockrunResult<ProcessHandle> {
        self.require_running("exec")?;

        let args = self.exec_args(command, &options.env, options.workdir.as_deref());
        let spawn_options = SpawnOptions {
            marker: options.marker.unwrap_or_else(|| self.marker.clone()),
            silent: options.silent.unwrap_or(self.silent),
            label: Some(options.label.unwrap_or_else(|| self.tool.label())),
            cancel: options.cancel.or_else(|| self.cancel.clone()),
            on_line: options.on_line,
            ..SpawnOptions::default()
        };

        let mut handle = self.spawn_tool(args, spawn_options)?;
        let code = handle.wait().await?;

        let success = match &options.success {
            Some(predicate) => predicate(code),
            None => default_success(code),
        };
        if !success {
            return Err(DockrunError::ExecFailed {
                command: command.to_string(),
                code,
            });
        }
        Ok(handle)
    }

    /// Arguments of the exec subcommand
    pub fn exec_args(
        &self,
        command: &str,
        env: &IndexMap<String, String>,
        workdir: Option<&str>,
    ) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        if let Some(dir) = workdir {
            args.push("-w".to_string());
            args.push(dir.to_string());
        }
        args.extend([
            self.id.clone(),
            self.shell.clone(),
            "-i".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]);
        args
    }

    /// Commit the container to `image_name`. Does not change state.
    pub async fn commit(&self, image_name: &str) -> DockrunResult<()> {
        self.run_checked(vec![
            "commit".to_string(),
            self.id.clone(),
            image_name.to_string(),
        ])
        .await?;
        info!("Committed {} as {}", self.id, image_name);
        Ok(())
    }

    /// Stop the container and wait for it
    pub async fn stop(&mut self) -> DockrunResult<()> {
        match self.state() {
            InstanceState::Stopped | InstanceState::Killed => {
                self.release_cleanup();
                return Ok(());
            }
            InstanceState::Running => {}
            _ => return Err(self.invalid("stop")),
        }

        self.run_checked(vec!["stop".to_string(), self.id.clone()])
            .await?;
        info!("Container {} stopped", self.id);
        self.state = InstanceState::Stopped;
        self.release_cleanup();
        Ok(())
    }

    /// Kill the container synchronously. Never fails and may be repeated;
    /// only the first call reaches the tool.
    pub fn kill(&mut self) {
        self.killer.kill();
        self.state = InstanceState::Killed;
        self.release_cleanup();
    }

    /// Copy a host file or directory into the container.
    ///
    /// Relative destinations are resolved against the mount path.
    pub async fn cp(&self, host_path: impl AsRef<Path>, container_path: &str) -> DockrunResult<()> {
        self.require_running("cp")?;

        let host_path = host_path.as_ref();
        let dest = self.container_path(container_path);
        self.run_checked(vec![
            "cp".to_string(),
            host_path.to_string_lossy().into_owned(),
            format!("{}:{}", self.id, dest),
        ])
        .await?;
        debug!("Copied {} to {}:{}", host_path.display(), self.id, dest);
        Ok(())
    }

    /// Copy a file or directory out of the container
    pub async fn copy_from(
        &self,
        container_path: &str,
        host_path: impl AsRef<Path>,
    ) -> DockrunResult<()> {
        self.require_running("copy from")?;

        let source = self.container_path(container_path);
        self.run_checked(vec![
            "cp".to_string(),
            format!("{}:{}", self.id, source),
            host_path.as_ref().to_string_lossy().into_owned(),
        ])
        .await?;
        Ok(())
    }

    /// Absolute in-container path for `path`
    pub fn container_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.mount_path.trim_end_matches('/'), path)
        }
    }

    fn tool_options(&self) -> SpawnOptions {
        SpawnOptions {
            marker: self.marker.clone(),
            silent: self.silent,
            label: Some(self.tool.label()),
            cancel: self.cancel.clone(),
            ..SpawnOptions::default()
        }
    }

    fn spawn_tool(&self, args: Vec<String>, options: SpawnOptions) -> DockrunResult<ProcessHandle> {
        process::spawn(&self.tool.program, self.tool.command_args(args), options)
    }

    async fn run_checked(&self, args: Vec<String>) -> DockrunResult<ProcessHandle> {
        let command = format!(
            "{} {}",
            self.tool.label(),
            args.first().map(String::as_str).unwrap_or_default()
        );
        let mut handle = self.spawn_tool(args, self.tool_options())?;
        let code = handle.wait().await?;
        if code != Some(0) {
            return Err(DockrunError::CommandFailed { command, code });
        }
        Ok(handle)
    }

    fn require_running(&self, operation: &'static str) -> DockrunResult<()> {
        if self.state() == InstanceState::Running {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn invalid(&self, operation: &'static str) -> DockrunError {
        DockrunError::InvalidState {
            operation,
            state: self.state().to_string(),
        }
    }

    fn release_cleanup(&mut self) {
        if let Some(hook) = self.hook.take() {
            self.registry.unregister(hook);
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.state() == InstanceState::Running && self.kill_on_drop {
            debug!("Instance {} dropped while running, killing", self.id);
            self.killer.kill();
        }
        self.release_cleanup();
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("image", &self.image)
            .field("state", &self.state())
            .field("shell", &self.shell)
            .field("workspace", &self.workspace)
            .finish()
    }
}
