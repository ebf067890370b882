//! dockrun - disposable container sandboxes
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use dockrun::cli::{Cli, Commands};
use dockrun::config::ConfigManager;
use dockrun::error::DockrunResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            match e.exit_code() {
                Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
                None => ExitCode::FAILURE,
            }
        }
    }
}

async fn run() -> DockrunResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("dockrun=warn"),
        1 => EnvFilter::new("dockrun=info"),
        _ => EnvFilter::new("dockrun=debug"),
    };

    if config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init();
    }

    match cli.command {
        Commands::Run(args) => dockrun::cli::commands::run(args, &config).await,
        Commands::Hash(args) => dockrun::cli::commands::hash(args).await,
        Commands::Config(args) => {
            dockrun::cli::commands::config(args, &config_manager, &config).await
        }
    }
}
