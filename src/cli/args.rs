//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// dockrun - disposable container sandboxes
///
/// Builds (with caching), starts, runs commands in and tears down a
/// throwaway container through the docker CLI.
#[derive(Parser, Debug)]
#[command(name = "dockrun")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "DOCKRUN_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command in a throwaway container
    Run(RunArgs),

    /// Print the build cache digest of a Dockerfile
    Hash(HashArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Image to run (ignored when --dockerfile is given)
    #[arg(long)]
    pub image: Option<String>,

    /// Build the image from this Dockerfile first
    #[arg(short = 'f', long)]
    pub dockerfile: Option<PathBuf>,

    /// Build context (defaults to the Dockerfile's directory)
    #[arg(long, requires = "dockerfile")]
    pub context: Option<PathBuf>,

    /// Tag for the built image (defaults to a digest-derived name)
    #[arg(short, long, requires = "dockerfile")]
    pub tag: Option<String>,

    /// Build arguments (KEY=VALUE), in order
    #[arg(long = "build-arg", value_parser = parse_key_value, requires = "dockerfile")]
    pub build_args: Vec<(String, String)>,

    /// Explicit cache record path
    #[arg(long, requires = "dockerfile")]
    pub hash_file: Option<PathBuf>,

    /// Host directory to mount as the container workspace
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Shell used inside the container
    #[arg(long)]
    pub shell: Option<String>,

    /// Environment variables for the command (KEY=VALUE)
    #[arg(short, long, value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Commit the container to this image after the command succeeds
    #[arg(long)]
    pub commit: Option<String>,

    /// Do not echo command output
    #[arg(short, long)]
    pub quiet: bool,

    /// Command to run inside the container
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Arguments for the hash command
#[derive(Parser, Debug)]
pub struct HashArgs {
    /// Dockerfile to hash
    #[arg(short = 'f', long)]
    pub dockerfile: PathBuf,

    /// Build arguments (KEY=VALUE), in order
    #[arg(long = "build-arg", value_parser = parse_key_value)]
    pub build_args: Vec<(String, String)>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., tool.program)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Parse a KEY=VALUE pair
fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE format: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}
