//! Configuration view and validation commands (`stagegate config`).

use std::path::Path;

use anyhow::Result;
use console::style;
use stagegate::config::{CONFIG_FILE, STATE_DIR, StagegateConfig, StagegateToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let state_dir = project_dir.join(STATE_DIR);
    let config_path = state_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("stagegate configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}; using defaults.", CONFIG_FILE, config_path.display());
            }
            println!();

            // Effective values include .env and STAGEGATE_* overrides.
            let config = StagegateConfig::load(project_dir.to_path_buf())?;
            print!("{}", toml::to_string_pretty(&config.toml)?);
            println!();
            println!("Store path: {}", config.store_path().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let toml = if config_path.exists() {
                StagegateToml::load(&config_path)?
            } else {
                println!("No {} found. Checking defaults.", CONFIG_FILE);
                StagegateToml::default()
            };
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("{}", style("Configuration is valid.").green());
            } else {
                println!("{}", style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&state_dir)?;
            StagegateToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [workers] stage_command, subtask_command, roles");
            println!("  - [workers] working_dir, timeout_secs, max_in_flight");
            println!("  - [engine] max_stage_revisions, max_item_revisions");
            println!("  - [store] backend, path");
            println!("  - [janitor] idle_timeout_secs");
            println!();
        }
    }

    Ok(())
}
