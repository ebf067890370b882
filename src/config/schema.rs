//! Configuration schema for dockrun
//!
//! Configuration is stored at `~/.config/dockrun/config.toml`

use serde::{Deserialize, Serialize};

/// Default marker prefix for captured output variables
pub const DEFAULT_MARKER: &str = "###=>";

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Container CLI settings
    pub tool: ToolConfig,

    /// Container defaults
    pub container: ContainerConfig,

    /// Output capture settings
    pub capture: CaptureConfig,

    /// Build cache settings
    pub cache: CacheConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// The external container CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Executable to invoke (docker, podman, ...)
    pub program: String,

    /// Global arguments placed before every subcommand (e.g. `--context`)
    pub args: Vec<String>,
}

impl ToolConfig {
    /// Full argument list for one subcommand invocation
    pub fn command_args<I, S>(&self, subcommand: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .iter()
            .cloned()
            .chain(subcommand.into_iter().map(Into::into))
            .collect()
    }

    /// Label used when echoing output, derived from the program name
    pub fn label(&self) -> String {
        std::path::Path::new(&self.program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            args: vec![],
        }
    }
}

/// Container defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Image used when no build is configured
    pub image: String,

    /// Shell used to interpret commands inside the container
    pub shell: String,

    /// Mount point of the host workspace inside the container
    pub mount_path: String,

    /// Foreground command keeping the container alive between execs
    pub idle_command: String,

    /// Kill a still-running container when its instance is dropped
    pub kill_on_drop: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "ubuntu:24.04".to_string(),
            shell: "bash".to_string(),
            mount_path: "/workspace".to_string(),
            idle_command: "while true; do sleep 3600; done".to_string(),
            kill_on_drop: true,
        }
    }
}

/// Output capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Prefix marking a stdout line as a `name=value` result
    pub marker: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
        }
    }
}

/// Build cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Require the cache record digest to match, not just the file to exist
    pub verify_digest: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            verify_digest: true,
        }
    }
}
