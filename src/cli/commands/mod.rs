//! CLI command implementations

pub mod config;
pub mod hash;
pub mod run;

pub use config::execute as config;
pub use hash::execute as hash;
pub use run::execute as run;
