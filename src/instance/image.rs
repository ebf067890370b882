//! Image reference of an instance

use crate::error::{DockrunError, DockrunResult};
use std::fmt;

/// The image an instance runs.
///
/// Starts as the requested default and is resolved exactly once during
/// `init`, either to that default or to the name of a freshly built image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Requested(String),
    Resolved(String),
}

impl ImageRef {
    pub fn name(&self) -> &str {
        match self {
            Self::Requested(name) | Self::Resolved(name) => name,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Move to `Resolved`; fails if already resolved
    pub fn resolve(&mut self, name: impl Into<String>) -> DockrunResult<()> {
        match self {
            Self::Requested(_) => {
                *self = Self::Resolved(name.into());
                Ok(())
            }
            Self::Resolved(current) => Err(DockrunError::ImageAlreadyResolved(current.clone())),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
