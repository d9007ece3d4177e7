//! Layered configuration for Dealflow.
//!
//! Values come from `dealflow.toml`, then environment variables, then CLI
//! flags, each layer overriding the one before it. Chatwoot connection
//! details stored through the settings API override this file at runtime.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! db_path = ".dealflow/dealflow.db"
//! cors_permissive = false
//!
//! [chatwoot]
//! base_url = "https://app.chatwoot.com"
//! account_id = 1
//! api_token = "..."
//! timeout_secs = 30
//! max_pages = 200
//!
//! [sync]
//! interval_secs = 0
//! create_deals = false
//! default_stage_id = 1
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::errors::CrmError;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "dealflow.toml";

/// HTTP server and storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Allow any origin (for a UI dev server on another port)
    #[serde(default)]
    pub cors_permissive: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".dealflow/dealflow.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            cors_permissive: false,
        }
    }
}

/// Chatwoot connection defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatwootSection {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub account_id: Option<i64>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub inbox_id: Option<i64>,
    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Upper bound on contact pages fetched per sync
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_pages() -> u32 {
    200
}

impl Default for ChatwootSection {
    fn default() -> Self {
        Self {
            base_url: None,
            account_id: None,
            api_token: None,
            inbox_id: None,
            timeout_secs: default_timeout_secs(),
            max_pages: default_max_pages(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSection {
    /// Seconds between scheduled syncs; 0 disables the scheduler
    #[serde(default)]
    pub interval_secs: u64,
    /// Open a deal for every newly imported contact
    #[serde(default)]
    pub create_deals: bool,
    /// Stage for imported deals; falls back to the first open stage
    #[serde(default)]
    pub default_stage_id: Option<i64>,
}

/// Parsed `dealflow.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DealflowToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub chatwoot: ChatwootSection,
    #[serde(default)]
    pub sync: SyncSection,
}

/// Flags that override file and environment values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
}

impl DealflowToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse dealflow.toml")
    }

    /// Load from `path` if it exists, otherwise return defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize dealflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Resolve the full file → env → CLI stack. An explicitly given config
    /// path must exist; the default one is optional.
    pub fn resolve(explicit_path: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        let mut config = match explicit_path {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(Path::new(CONFIG_FILE))?,
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_cli(cli);
        Ok(config)
    }

    /// Overlay environment variables, read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = get("DEALFLOW_PORT") {
            self.server.port = parse_env("DEALFLOW_PORT", &port)?;
        }
        if let Some(path) = get("DEALFLOW_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(url) = get("CHATWOOT_BASE_URL") {
            self.chatwoot.base_url = Some(url);
        }
        if let Some(account) = get("CHATWOOT_ACCOUNT_ID") {
            self.chatwoot.account_id = Some(parse_env("CHATWOOT_ACCOUNT_ID", &account)?);
        }
        if let Some(token) = get("CHATWOOT_API_TOKEN") {
            self.chatwoot.api_token = Some(token);
        }
        if let Some(interval) = get("DEALFLOW_SYNC_INTERVAL") {
            self.sync.interval_secs = parse_env("DEALFLOW_SYNC_INTERVAL", &interval)?;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(path) = &cli.db_path {
            self.server.db_path = path.clone();
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; the OS will pick a random port".to_string());
        }
        if self.chatwoot.timeout_secs == 0 {
            warnings.push("chatwoot.timeout_secs is 0; requests will time out immediately".into());
        }
        if self.chatwoot.max_pages == 0 {
            warnings.push("chatwoot.max_pages is 0; at least one page is always fetched".into());
        }
        let connection = [
            self.chatwoot.base_url.is_some(),
            self.chatwoot.account_id.is_some(),
            self.chatwoot.api_token.is_some(),
        ];
        if connection.iter().any(|set| *set) && !connection.iter().all(|set| *set) {
            warnings.push(
                "chatwoot section is incomplete: base_url, account_id and api_token are all required"
                    .to_string(),
            );
        }
        if self.sync.interval_secs > 0 && self.chatwoot.base_url.is_none() {
            warnings.push(
                "sync.interval_secs is set but no Chatwoot base_url is configured in the file"
                    .to_string(),
            );
        }

        warnings
    }

    /// Render with the API token masked, for `config show`.
    pub fn to_display_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if let Some(token) = &shown.chatwoot.api_token {
            shown.chatwoot.api_token = Some(mask_secret(token));
        }
        toml::to_string_pretty(&shown).context("Failed to serialize dealflow.toml")
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| CrmError::Config(format!("{} has an invalid value '{}'", key, value)).into())
}

/// Keep the last four characters of a secret, star out the rest.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), visible)
}
