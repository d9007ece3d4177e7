//! Sales pipeline back-end: kanban deals, contacts and Chatwoot sync.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │  (board) │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ PipelineQuery::from_params()           │
//!                       │         v                                        │
//!                       │  pipeline.rs  (filter, sort, summarize, board)   │
//!                       │                                                  │
//!                       │  sync.rs  (SyncService, SyncScheduler)           │
//!                       │         │ plan_sync() → apply_sync()             │
//!                       │         v                                        │
//!                       │  chatwoot.rs  (ChatwootClient, paginated fetch)  │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                              |
//! |----------|-------------------------------------------------------------|
//! | `models` | Shared types: `Deal`, `PipelineStage`, `Contact`, ...       |
//! | `db`     | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |
//! | `ws`     | `WsMessage` enum + `broadcast_message()` helper             |
//!
//! ## Typical Request Flow (drag a deal into "Won")
//!
//! 1. `PATCH /api/deals/{id}/move` → `api::move_deal()`
//! 2. `CrmDb::move_deal` renumbers both columns in one transaction, derives
//!    the deal status from the target stage kind and logs activities.
//! 3. The handler broadcasts `WsMessage::DealMoved` so every open board
//!    refreshes the two affected columns.

pub mod api;
pub mod chatwoot;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod sync;
pub mod ws;
