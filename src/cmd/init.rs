//! Database initialization command (`dealflow init`).

use anyhow::Result;
use dealflow::config::CliOverrides;
use dealflow::crm::server::open_database;

use super::super::Cli;

pub fn cmd_init(cli: &Cli) -> Result<()> {
    let config = super::load_config(cli, CliOverrides::default())?;
    let db_path = &config.server.db_path;
    let existed = db_path.exists();

    let db = open_database(db_path)?;
    let stages = db.list_stages()?;
    let reasons = db.list_loss_reasons(true)?;

    if existed {
        println!("Database already exists at {}", db_path.display());
    } else {
        println!("Initialized database at {}", db_path.display());
    }
    println!();
    println!("Stages ({}):", stages.len());
    for stage in &stages {
        println!("  {:>3}  {:<16} {}", stage.id, stage.name, stage.kind.as_str());
    }
    println!("Loss reasons: {}", reasons.len());
    println!();
    println!("Next steps:");
    println!("  1. Run `dealflow config init` to create dealflow.toml");
    println!("  2. Run `dealflow serve` to start the server");
    Ok(())
}
