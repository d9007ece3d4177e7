use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "dealflow")]
#[command(version, about = "Sales pipeline server with Chatwoot contact sync")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to dealflow.toml (defaults to ./dealflow.toml when present)
    #[arg(long, global = true, env = "DEALFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database path. Overrides dealflow.toml and DEALFLOW_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database and seed default stages and loss reasons
    Init,
    /// Run the HTTP/WebSocket server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (CORS permissive for a local front-end dev server)
        #[arg(long)]
        dev: bool,
    },
    /// Import contacts from Chatwoot once and exit
    Sync,
    /// Print pipeline totals, optionally filtered
    Summary {
        /// Free-text search over title, owner, tags and contact
        #[arg(long)]
        search: Option<String>,

        /// Deal statuses (comma-separated: open,won,lost)
        #[arg(long)]
        status: Option<String>,

        /// Stage ids (comma-separated)
        #[arg(long)]
        stage: Option<String>,

        #[arg(long)]
        owner: Option<String>,

        /// Tags (comma-separated, all must match)
        #[arg(long)]
        tags: Option<String>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration (token masked)
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default dealflow.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    dealflow::logging::init_logging(cli.verbose, cli.log_json);

    match &cli.command {
        Commands::Init => cmd::cmd_init(&cli)?,
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(&cli, *port, host.clone(), *dev).await?;
        }
        Commands::Sync => cmd::cmd_sync(&cli).await?,
        Commands::Summary {
            search,
            status,
            stage,
            owner,
            tags,
            json,
        } => {
            let filters = cmd::SummaryFilters {
                search: search.clone(),
                statuses: status.clone(),
                stage_ids: stage.clone(),
                owner: owner.clone(),
                tags: tags.clone(),
            };
            cmd::cmd_summary(&cli, &filters, *json)?;
        }
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
    }

    Ok(())
}
