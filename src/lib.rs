//! dockrun - disposable container sandboxes
//!
//! Drives an external container CLI to build (with content-addressed
//! caching), start, exec into, copy files to and tear down a single
//! container, capturing structured output from the commands it runs.

pub mod build;
pub mod cli;
pub mod config;
pub mod error;
pub mod instance;
pub mod process;

pub use error::{DockrunError, DockrunResult};
pub use instance::{ExecOptions, Instance, InstanceOptions, InstanceState};
pub use process::{spawn, spawn_sync, ProcessHandle, SpawnOptions};
