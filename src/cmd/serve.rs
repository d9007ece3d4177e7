//! HTTP server command (`dealflow serve`).

use anyhow::Result;
use dealflow::config::CliOverrides;
use dealflow::crm::server::{ServerConfig, start_server};

use super::super::Cli;

pub async fn cmd_serve(cli: &Cli, port: Option<u16>, host: Option<String>, dev: bool) -> Result<()> {
    let config = super::load_config(
        cli,
        CliOverrides {
            host,
            port,
            db_path: None,
        },
    )?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    start_server(ServerConfig::from_toml(&config, dev)).await
}
