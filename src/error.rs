//! Error types for dockrun
//!
//! All modules use `DockrunResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for dockrun operations
pub type DockrunResult<T> = Result<T, DockrunError>;

/// All errors that can occur in dockrun
#[derive(Error, Debug)]
pub enum DockrunError {
    // Process errors
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command failed: {command}, exit code: {}", display_code(.code))]
    CommandFailed { command: String, code: Option<i32> },

    // Container errors
    #[error("Image build failed: {image}, exit code: {}", display_code(.code))]
    BuildFailed { image: String, code: Option<i32> },

    #[error("Container failed to start: {0}")]
    ContainerStart(String),

    #[error("Container command failed: {command}, exit code: {}", display_code(.code))]
    ExecFailed { command: String, code: Option<i32> },

    #[error("Cannot {operation} while instance is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Image already resolved to {0}")]
    ImageAlreadyResolved(String),

    #[error("Interrupted, container killed")]
    Interrupted,

    // Cache errors
    #[error("Invalid cache record {path}: {reason}")]
    CacheRecord { path: PathBuf, reason: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

impl DockrunError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a spawn error
    pub fn spawn(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            command: command.into(),
            source,
        }
    }

    /// Exit code carried by a failed subprocess, if any
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { code, .. }
            | Self::BuildFailed { code, .. }
            | Self::ExecFailed { code, .. } => *code,
            _ => None,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                Some("Install docker or set tool.program in the config file")
            }
            Self::ContainerStart(_) => Some("Check that the container daemon is running"),
            Self::BuildFailed { .. } => Some("Run the build by hand with -v to see the full output"),
            _ => None,
        }
    }
}
