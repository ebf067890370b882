//! Run command - execute a command in a throwaway container

use crate::build::{BuildArgs, BuildConfig};
use crate::cli::args::RunArgs;
use crate::config::Config;
use crate::error::{DockrunError, DockrunResult};
use crate::instance::{CleanupHooks, CleanupRegistry, ExecOptions, Instance, InstanceOptions};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Execute the run command
pub async fn execute(args: RunArgs, config: &Config) -> DockrunResult<()> {
    let hooks = Arc::new(CleanupHooks::new());
    let watcher = hooks.watch_signals()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    hooks.register(Box::new(move || on_signal.cancel()));

    let build = args.dockerfile.as_deref().map(|dockerfile| build_config(&args, dockerfile));
    let building = build.is_some();

    let options = InstanceOptions {
        image: args.image.clone(),
        shell: args.shell.clone(),
        workspace: args.workspace.clone(),
        build,
        cancel: Some(cancel.clone()),
        silent: true,
    };
    let mut instance = Instance::new(config, options, hooks.clone());
    debug!("Instance {:?}", instance);

    let pb = create_progress_bar(if building {
        "Preparing image..."
    } else {
        "Starting container..."
    });
    let init = instance.init().await;
    pb.finish_and_clear();
    init?;

    let command = args.command.join(" ");
    let exec_options = ExecOptions {
        silent: Some(args.quiet),
        env: args.env.iter().cloned().collect(),
        ..ExecOptions::default()
    };

    let result = instance.exec(&command, exec_options).await;
    if cancel.is_cancelled() {
        instance.kill();
        watcher.abort();
        return Err(DockrunError::Interrupted);
    }

    let handle = match result {
        Ok(handle) => handle,
        Err(e) => {
            instance.kill();
            watcher.abort();
            return Err(e);
        }
    };

    let vars = handle.vars();
    if !vars.is_empty() {
        println!("{}", serde_json::to_string_pretty(&vars)?);
    }

    if let Some(image) = &args.commit {
        instance.commit(image).await?;
        println!(
            "{} Committed {} as {}",
            style("✓").green(),
            style(instance.id()).cyan(),
            style(image).cyan()
        );
    }

    instance.stop().await?;
    watcher.abort();
    Ok(())
}

fn build_config(args: &RunArgs, dockerfile: &Path) -> BuildConfig {
    let context = args.context.clone().unwrap_or_else(|| {
        dockerfile
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    });

    BuildConfig {
        dockerfile: dockerfile.to_path_buf(),
        context,
        image_name: args.tag.clone(),
        build_args: args.build_args.iter().cloned().collect::<BuildArgs>(),
        hash_file: args.hash_file.clone(),
    }
}

fn create_progress_bar(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(spinner) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(spinner);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}
