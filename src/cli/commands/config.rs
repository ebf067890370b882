//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{DockrunError, DockrunResult};
use console::style;

/// Execute the config command
pub async fn execute(args: ConfigArgs, manager: &ConfigManager, config: &Config) -> DockrunResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => {
            let mut config = config.clone();
            set_value(&mut config, &key, &value)?;
            manager.save(&config).await?;
            println!(
                "{} Set {} = {}",
                style("✓").green(),
                style(&key).cyan(),
                value
            );
        }
    }

    Ok(())
}

fn show_config(config: &Config) -> DockrunResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> DockrunResult<()> {
    let path = manager.path();

    if path.exists() && !force {
        println!(
            "{} Config already exists at {} (use --force to overwrite)",
            style("!").yellow(),
            path.display()
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    println!(
        "{} Configuration initialized ({})",
        style("✓").green(),
        path.display()
    );
    Ok(())
}

fn set_value(config: &mut Config, key: &str, value: &str) -> DockrunResult<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["general", "log_format"] => config.general.log_format = value.to_string(),

        ["tool", "program"] => config.tool.program = value.to_string(),
        ["tool", "args"] => {
            config.tool.args = value.split_whitespace().map(str::to_string).collect();
        }

        ["container", "image"] => config.container.image = value.to_string(),
        ["container", "shell"] => config.container.shell = value.to_string(),
        ["container", "mount_path"] => config.container.mount_path = value.to_string(),
        ["container", "idle_command"] => config.container.idle_command = value.to_string(),
        ["container", "kill_on_drop"] => config.container.kill_on_drop = parse_bool(key, value)?,

        ["capture", "marker"] => config.capture.marker = value.to_string(),

        ["cache", "verify_digest"] => config.cache.verify_digest = parse_bool(key, value)?,

        _ => {
            return Err(DockrunError::ConfigInvalid {
                path: key.into(),
                reason: "unknown configuration key".to_string(),
            })
        }
    }

    Ok(())
}

fn parse_bool(key: &str, value: &str) -> DockrunResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(DockrunError::ConfigInvalid {
            path: key.into(),
            reason: format!("invalid boolean: {value}"),
        }),
    }
}
