//! Image builds with content-addressed caching
//!
//! The image name and cache record path are derived from a digest of the
//! Dockerfile and build args. A record left by an earlier build lets `init`
//! skip the build entirely.

pub mod hash;
pub mod record;

pub use hash::{build_arg_tokens, digest, digest_hex, hash_dockerfile, BuildArgs};
pub use record::{default_record_path, CacheRecord};

use crate::error::DockrunResult;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Namespace for images named after their digest
pub const IMAGE_NAMESPACE: &str = "dockrun-build";

/// How to build the instance image
#[derive(Debug, Clone, PartialEq)]
pub struct BuildConfig {
    /// Path to the Dockerfile
    pub dockerfile: PathBuf,
    /// Build context directory
    pub context: PathBuf,
    /// Explicit image name, otherwise derived from the digest
    pub image_name: Option<String>,
    /// Build args in the order they are passed to the tool
    pub build_args: BuildArgs,
    /// Explicit cache record path, otherwise next to the Dockerfile
    pub hash_file: Option<PathBuf>,
}

impl BuildConfig {
    pub fn new(dockerfile: impl Into<PathBuf>, context: impl Into<PathBuf>) -> Self {
        Self {
            dockerfile: dockerfile.into(),
            context: context.into(),
            image_name: None,
            build_args: BuildArgs::new(),
            hash_file: None,
        }
    }

    pub fn image_name(mut self, name: impl Into<String>) -> Self {
        self.image_name = Some(name.into());
        self
    }

    pub fn build_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_args.insert(key.into(), value.into());
        self
    }

    pub fn hash_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.hash_file = Some(path.into());
        self
    }
}

/// Everything derived from a [`BuildConfig`] before building
#[derive(Debug, Clone, PartialEq)]
pub struct BuildPlan {
    /// Hex digest of Dockerfile + build args
    pub digest: String,
    /// Image tag to build
    pub image: String,
    /// Where the cache record lives
    pub record_path: PathBuf,
}

impl BuildPlan {
    /// Hash the Dockerfile and derive image name and record path
    pub async fn prepare(config: &BuildConfig) -> DockrunResult<Self> {
        let digest = hash_dockerfile(&config.dockerfile, &config.build_args).await?;
        Ok(Self::from_digest(config, digest))
    }

    /// Derive image name and record path from a known digest
    pub fn from_digest(config: &BuildConfig, digest: String) -> Self {
        let image = config
            .image_name
            .clone()
            .unwrap_or_else(|| format!("{IMAGE_NAMESPACE}-{digest}"));
        let record_path = config
            .hash_file
            .clone()
            .unwrap_or_else(|| default_record_path(&config.dockerfile, &image));

        debug!("Build plan: image {} record {}", image, record_path.display());
        Self {
            digest,
            image,
            record_path,
        }
    }

    /// Arguments of the build subcommand
    pub fn command_args(&self, config: &BuildConfig) -> Vec<String> {
        let mut args = vec!["build".to_string()];
        args.extend(build_arg_tokens(&config.build_args));
        args.push("-t".to_string());
        args.push(self.image.clone());
        args.push("-f".to_string());
        args.push(path_arg(&config.dockerfile));
        args.push(path_arg(&config.context));
        args
    }

    /// Whether an earlier build can be reused.
    ///
    /// Without `verify_digest` only the record's existence counts. With it,
    /// the stored hash must equal this plan's digest; unreadable records
    /// count as a miss.
    pub async fn is_cached(&self, verify_digest: bool) -> bool {
        if !verify_digest {
            return self.record_path.exists();
        }

        match CacheRecord::load(&self.record_path).await {
            Ok(Some(record)) if record.hash == self.digest => true,
            Ok(Some(record)) => {
                info!(
                    "Cache record {} is stale ({} != {}), rebuilding",
                    self.record_path.display(),
                    record.hash,
                    self.digest
                );
                false
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Ignoring unreadable cache record: {}", e);
                false
            }
        }
    }

    /// Record to persist after a successful build
    pub fn record(&self, config: &BuildConfig) -> CacheRecord {
        CacheRecord::new(&self.digest, config.build_args.clone(), &self.image)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
