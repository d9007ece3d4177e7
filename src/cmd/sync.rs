//! One-shot Chatwoot import (`dealflow sync`).

use anyhow::Result;
use dealflow::config::CliOverrides;
use dealflow::crm::db::DbHandle;
use dealflow::crm::server::open_database;
use dealflow::crm::sync::SyncService;

use super::super::Cli;

pub async fn cmd_sync(cli: &Cli) -> Result<()> {
    let config = super::load_config(cli, CliOverrides::default())?;
    let db = DbHandle::new(open_database(&config.server.db_path)?);
    let service = SyncService::new(db, config.chatwoot.clone(), config.sync.clone());

    let report = service.run_now().await?;
    let elapsed = report.finished_at - report.started_at;

    println!("Chatwoot sync finished in {}ms", elapsed.num_milliseconds());
    println!("  Remote contacts: {}", report.total_remote);
    println!("  Created:         {}", report.created);
    println!("  Updated:         {}", report.updated);
    println!("  Unchanged:       {}", report.unchanged);
    if report.deals_created > 0 {
        println!("  Deals opened:    {}", report.deals_created);
    }
    Ok(())
}
