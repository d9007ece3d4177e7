use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::db::{CrmDb, DbHandle};
use super::sync::{SyncScheduler, SyncService};
use super::ws;
use crate::config::{ChatwootSection, DealflowToml, SyncSection};

/// Configuration for the CRM server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: std::path::PathBuf,
    /// Permissive CORS for a local front-end dev server.
    pub dev_mode: bool,
    pub chatwoot: ChatwootSection,
    pub sync: SyncSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            db_path: std::path::PathBuf::from(".dealflow/dealflow.db"),
            dev_mode: false,
            chatwoot: ChatwootSection::default(),
            sync: SyncSection::default(),
        }
    }
}

impl ServerConfig {
    /// Server settings from a resolved config; `dev` forces permissive CORS.
    pub fn from_toml(toml: &DealflowToml, dev: bool) -> Self {
        Self {
            host: toml.server.host.clone(),
            port: toml.server.port,
            db_path: toml.server.db_path.clone(),
            dev_mode: dev || toml.server.cors_permissive,
            chatwoot: toml.chatwoot.clone(),
            sync: toml.sync.clone(),
        }
    }
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>, cors_permissive: bool) -> Router {
    let ws_tx = state.ws_tx.clone();

    let app = api::api_router()
        .route(
            "/ws",
            get(move |ws_upgrade| ws::ws_handler_with_sender(ws_upgrade, ws_tx)),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors_permissive {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Open (creating if needed) the database at `path` and seed defaults.
pub fn open_database(path: &std::path::Path) -> Result<CrmDb> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = CrmDb::new(path).context("Failed to initialize CRM database")?;
    if db.seed_defaults()? {
        tracing::info!(path = %path.display(), "Seeded default stages and loss reasons");
    }
    Ok(db)
}

/// Start the CRM server and the periodic sync, if configured.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = DbHandle::new(open_database(&config.db_path)?);
    let (ws_tx, _rx) = broadcast::channel::<String>(256);

    let sync = SyncService::new(db.clone(), config.chatwoot.clone(), config.sync.clone())
        .with_broadcast(ws_tx.clone());
    let scheduler = SyncScheduler::new(sync.clone(), config.sync.interval_secs).map(|s| {
        tracing::info!(interval_secs = config.sync.interval_secs, "Scheduled Chatwoot sync enabled");
        s.spawn()
    });

    let state = Arc::new(AppState { db, ws_tx, sync });
    let app = build_router(state, config.dev_mode);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, db_path = %config.db_path.display(), "Dealflow server listening");
    println!("Dealflow running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(handle) = scheduler {
        handle.abort();
    }
    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down...");
}
