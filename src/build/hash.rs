//! Content digest for build-cache decisions
//!
//! The digest covers the Dockerfile bytes followed by the rendered build
//! arguments, in the order they were supplied. Same inputs, same image.

use crate::error::{DockrunError, DockrunResult};
use indexmap::IndexMap;
use sha1::{Digest, Sha1};
use std::path::Path;

/// Build arguments, kept in insertion order
pub type BuildArgs = IndexMap<String, String>;

/// Render build arguments as alternating `--build-arg`, `key=value` tokens
pub fn build_arg_tokens(args: &BuildArgs) -> Vec<String> {
    args.iter()
        .flat_map(|(key, value)| ["--build-arg".to_string(), format!("{key}={value}")])
        .collect()
}

/// SHA-1 over the Dockerfile bytes and the space-joined build-arg tokens
pub fn digest(dockerfile: &[u8], args: &BuildArgs) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(dockerfile);
    hasher.update(build_arg_tokens(args).join(" ").as_bytes());
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Lowercase hex rendering of [`digest`]
pub fn digest_hex(dockerfile: &[u8], args: &BuildArgs) -> String {
    hex::encode(digest(dockerfile, args))
}

/// Read a Dockerfile and digest it together with `args`
pub async fn hash_dockerfile(path: &Path, args: &BuildArgs) -> DockrunResult<String> {
    let contents = tokio::fs::read(path)
        .await
        .map_err(|e| DockrunError::io(format!("reading Dockerfile {}", path.display()), e))?;
    Ok(digest_hex(&contents, args))
}
