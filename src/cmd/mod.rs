//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled              |
//! |-----------|-------------------------------|
//! | `init`    | `Init`                        |
//! | `serve`   | `Serve`                       |
//! | `sync`    | `Sync`                        |
//! | `summary` | `Summary`                     |
//! | `config`  | `Config`                      |

pub mod config;
pub mod init;
pub mod serve;
pub mod summary;
pub mod sync;

pub use config::cmd_config;
pub use init::cmd_init;
pub use serve::cmd_serve;
pub use summary::{SummaryFilters, cmd_summary};
pub use sync::cmd_sync;

use anyhow::Result;
use dealflow::config::{CliOverrides, DealflowToml};

use super::Cli;

/// Resolve file → env → CLI configuration for a command.
pub(crate) fn load_config(cli: &Cli, overrides: CliOverrides) -> Result<DealflowToml> {
    let overrides = CliOverrides {
        db_path: overrides.db_path.or_else(|| cli.db_path.clone()),
        ..overrides
    };
    DealflowToml::resolve(cli.config.as_deref(), &overrides)
}
