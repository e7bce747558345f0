//! Configuration view and validation commands: `tfgen config`.

use std::path::Path;

use anyhow::{Context, Result, bail};

use super::super::ConfigCommands;
use tfgen::config::{TfgenConfig, TfgenToml};

pub fn cmd_config(config_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config_dir.join("tfgen.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            let config = TfgenConfig::load(config_dir.to_path_buf())?;
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; showing defaults", config_path.display());
            }
            println!("{}", config.toml.to_toml_string()?);
        }
        Some(ConfigCommands::Validate) => {
            let config = TfgenConfig::load(config_dir.to_path_buf())?;
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                for problem in &problems {
                    println!("  - {}", problem);
                }
                bail!("Configuration has {} problem(s)", problems.len());
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            std::fs::create_dir_all(config_dir)
                .with_context(|| format!("Failed to create {}", config_dir.display()))?;
            std::fs::write(&config_path, TfgenToml::default().to_toml_string()?)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            println!("Wrote {}", config_path.display());
        }
    }

    Ok(())
}
