//! Typed error hierarchy for Dealflow.
//!
//! `CrmError` covers the CRM API, persistence and Chatwoot sync. Internal
//! code propagates `anyhow::Error` with context and attaches a `CrmError`
//! where the caller needs to branch on the failure (the HTTP layer maps
//! them to status codes by downcasting).

use thiserror::Error;

/// Errors from the CRM API, store and contact sync.
#[derive(Debug, Error)]
pub enum CrmError {
    #[error("Deal {id} not found")]
    DealNotFound { id: i64 },

    #[error("Stage {id} not found")]
    StageNotFound { id: i64 },

    #[error("Contact {id} not found")]
    ContactNotFound { id: i64 },

    #[error("Loss reason {id} not found")]
    LossReasonNotFound { id: i64 },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("A contact sync is already running")]
    SyncInProgress,

    #[error("Chatwoot is not configured: {0}")]
    ChatwootNotConfigured(String),

    #[error("Chatwoot rejected the API token")]
    ChatwootAuth,

    #[error("Chatwoot returned HTTP {status}: {message}")]
    ChatwootUpstream { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrmError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DealNotFound { .. }
                | Self::StageNotFound { .. }
                | Self::ContactNotFound { .. }
                | Self::LossReasonNotFound { .. }
        )
    }
}
