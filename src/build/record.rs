//! Build cache record persistence
//!
//! A small JSON sidecar written after a successful build. Its presence at
//! the expected path marks the image as already built.

use crate::build::hash::BuildArgs;
use crate::error::{DockrunError, DockrunResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Cache record contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    /// Hex digest of Dockerfile + build args
    pub hash: String,

    /// When the image was built
    pub created_at: DateTime<Utc>,

    /// Build args used
    pub args: BuildArgs,

    /// Resolved image name
    pub image: String,
}

impl CacheRecord {
    /// Create a record stamped with the current time
    pub fn new(hash: impl Into<String>, args: BuildArgs, image: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            created_at: Utc::now(),
            args,
            image: image.into(),
        }
    }

    /// Load a record, `None` if the file does not exist
    pub async fn load(path: &Path) -> DockrunResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| DockrunError::io(format!("reading cache record {}", path.display()), e))?;

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| DockrunError::CacheRecord {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    /// Write the record, creating parent directories
    pub async fn save(&self, path: &Path) -> DockrunResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DockrunError::io("creating cache record directory", e))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .await
            .map_err(|e| DockrunError::io(format!("writing cache record {}", path.display()), e))?;

        Ok(())
    }
}

/// Default record location: next to the Dockerfile, keyed by image name.
///
/// `docker/Dockerfile` + `app:1.0` gives `docker/Dockerfile.app_1.0.hash.json`.
pub fn default_record_path(dockerfile: &Path, image: &str) -> PathBuf {
    let file_name = dockerfile
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Dockerfile".to_string());
    let image: String = image
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    dockerfile.with_file_name(format!("{file_name}.{image}.hash.json"))
}
