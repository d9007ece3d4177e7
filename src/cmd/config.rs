//! Configuration view and validation commands (`dealflow config`).

use anyhow::Result;
use dealflow::config::{CONFIG_FILE, CliOverrides, DealflowToml};

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from(CONFIG_FILE));

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Dealflow Configuration");
            println!("======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found; showing defaults.", config_path.display());
            }
            println!("Effective values (with env/CLI overrides):");
            println!();
            let config = super::load_config(cli, CliOverrides::default())?;
            print!("{}", config.to_display_toml()?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = super::load_config(cli, CliOverrides::default())?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("{} already exists.", config_path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }

            DealflowToml::default().save(&config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, db_path, cors_permissive");
            println!("  - [chatwoot] base_url, account_id, api_token, inbox_id");
            println!("  - [sync] interval_secs, create_deals, default_stage_id");
            println!();
        }
    }

    Ok(())
}
