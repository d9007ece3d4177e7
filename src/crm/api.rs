use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::db::{CrmDb, DbHandle, LossReasonRemoval};
use super::models::*;
use super::pipeline::{self, PipelineQuery};
use super::sync::{self, SyncService};
use super::ws::{WsMessage, broadcast_message};
use crate::config::{ChatwootSection, SyncSection, mask_secret};
use crate::errors::CrmError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<String>,
    pub sync: SyncService,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateStageRequest {
    pub name: String,
    pub color: Option<String>,
    pub kind: Option<StageKind>,
}

#[derive(Deserialize)]
pub struct UpdateStageRequest {
    pub name: Option<String>,
    pub color: Option<String>,
    pub kind: Option<StageKind>,
}

#[derive(Deserialize)]
pub struct ReorderStagesRequest {
    pub stage_ids: Vec<i64>,
}

#[derive(Deserialize)]
pub struct DeleteStageParams {
    pub move_to: Option<i64>,
}

#[derive(Deserialize)]
pub struct MoveDealRequest {
    pub stage_id: i64,
    pub position: i32,
}

#[derive(Deserialize)]
pub struct MarkLostRequest {
    pub loss_reason_id: i64,
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct ReopenParams {
    pub stage_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct AddActivityRequest {
    pub kind: ActivityKind,
    pub content: String,
}

#[derive(Deserialize)]
pub struct ContactSearchParams {
    pub search: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateContactRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub email: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub company: Option<Option<String>>,
}

#[derive(Deserialize)]
pub struct LossReasonListParams {
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Deserialize)]
pub struct CreateLossReasonRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct UpdateLossReasonRequest {
    pub name: Option<String>,
    pub active: Option<bool>,
}

/// Write request for the Chatwoot connection. An empty `api_token` clears
/// the stored token; `null` clears the nullable fields.
#[derive(Deserialize)]
pub struct UpdateChatwootSettingsRequest {
    pub base_url: Option<String>,
    pub account_id: Option<i64>,
    pub api_token: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub inbox_id: Option<Option<i64>>,
    pub create_deals: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    pub default_stage_id: Option<Option<i64>>,
}

/// Chatwoot connection as shown to clients; the token never leaves in clear.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatwootSettingsView {
    pub base_url: Option<String>,
    pub account_id: Option<i64>,
    pub inbox_id: Option<i64>,
    pub api_token_configured: bool,
    pub api_token_preview: Option<String>,
    pub create_deals: bool,
    pub default_stage_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub last_run_at: Option<String>,
    pub last_report: Option<sync::SyncReport>,
    pub last_error: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<CrmError> for ApiError {
    fn from(err: CrmError) -> Self {
        classify(&err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(crm) = err.downcast_ref::<CrmError>() {
            return classify(crm);
        }
        if err.chain().any(|cause| cause.is::<reqwest::Error>()) {
            return ApiError::BadGateway(format!("{:#}", err));
        }
        tracing::error!(error = %format!("{:#}", err), "Request failed");
        ApiError::Internal(format!("{:#}", err))
    }
}

fn classify(err: &CrmError) -> ApiError {
    let message = err.to_string();
    match err {
        e if e.is_not_found() => ApiError::NotFound(message),
        CrmError::BadRequest(_) | CrmError::ChatwootNotConfigured(_) => {
            ApiError::BadRequest(message)
        }
        CrmError::Conflict(_) | CrmError::SyncInProgress => ApiError::Conflict(message),
        CrmError::ChatwootAuth | CrmError::ChatwootUpstream { .. } => {
            ApiError::BadGateway(message)
        }
        _ => {
            tracing::error!(error = %message, "Request failed");
            ApiError::Internal(message)
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/stages", get(list_stages).post(create_stage))
        .route("/api/stages/reorder", put(reorder_stages))
        .route("/api/stages/{id}", patch(update_stage).delete(delete_stage))
        .route("/api/board", get(get_board))
        .route("/api/pipeline/summary", get(get_summary))
        .route("/api/deals", get(list_deals).post(create_deal))
        .route(
            "/api/deals/{id}",
            get(get_deal).patch(update_deal).delete(delete_deal),
        )
        .route("/api/deals/{id}/move", patch(move_deal))
        .route("/api/deals/{id}/won", post(mark_won))
        .route("/api/deals/{id}/lost", post(mark_lost))
        .route("/api/deals/{id}/reopen", post(reopen_deal))
        .route(
            "/api/deals/{id}/activities",
            get(list_activities).post(add_activity),
        )
        .route("/api/contacts", get(list_contacts).post(create_contact))
        .route(
            "/api/contacts/{id}",
            get(get_contact).patch(update_contact).delete(delete_contact),
        )
        .route(
            "/api/loss-reasons",
            get(list_loss_reasons).post(create_loss_reason),
        )
        .route(
            "/api/loss-reasons/{id}",
            patch(update_loss_reason).delete(delete_loss_reason),
        )
        .route(
            "/api/settings/chatwoot",
            get(get_chatwoot_settings).put(put_chatwoot_settings),
        )
        .route("/api/chatwoot/test", post(test_chatwoot))
        .route("/api/chatwoot/sync", post(sync_chatwoot))
        .route("/api/chatwoot/status", get(chatwoot_status))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

// Stages

async fn list_stages(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let stages = state.db.call(|db| db.list_stages()).await?;
    Ok(Json(stages))
}

async fn create_stage(
    State(state): State<SharedState>,
    Json(req): Json<CreateStageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = req.kind.unwrap_or(StageKind::Open);
    let stage = state
        .db
        .call(move |db| db.create_stage(&req.name, req.color.as_deref(), kind))
        .await?;
    tracing::info!(stage_id = stage.id, name = %stage.name, "Stage created");
    broadcast_message(&state.ws_tx, &WsMessage::StageChanged { stage: stage.clone() });
    Ok((StatusCode::CREATED, Json(stage)))
}

async fn update_stage(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateStageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stage = state
        .db
        .call(move |db| db.update_stage(id, req.name.as_deref(), req.color.as_deref(), req.kind))
        .await?;
    broadcast_message(&state.ws_tx, &WsMessage::StageChanged { stage: stage.clone() });
    Ok(Json(stage))
}

async fn reorder_stages(
    State(state): State<SharedState>,
    Json(req): Json<ReorderStagesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stages = state
        .db
        .call(move |db| db.reorder_stages(&req.stage_ids))
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::StagesReordered {
            stage_ids: stages.iter().map(|s| s.id).collect(),
        },
    );
    Ok(Json(stages))
}

async fn delete_stage(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(params): Query<DeleteStageParams>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .db
        .call(move |db| db.delete_stage(id, params.move_to))
        .await?;
    if !deleted {
        return Err(CrmError::StageNotFound { id }.into());
    }
    tracing::info!(stage_id = id, move_to = ?params.move_to, "Stage deleted");
    broadcast_message(&state.ws_tx, &WsMessage::StageDeleted { stage_id: id });
    Ok(StatusCode::NO_CONTENT)
}

// Board and pipeline views

/// Everything the pipeline views are computed from.
fn load_snapshot(db: &CrmDb) -> anyhow::Result<(Vec<PipelineStage>, Vec<DealCard>, Vec<LossReason>)> {
    Ok((
        db.list_stages()?,
        db.list_deal_cards()?,
        db.list_loss_reasons(true)?,
    ))
}

async fn get_board(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let query = PipelineQuery::from_params(&params)?;
    let (stages, cards, reasons) = state.db.call(load_snapshot).await?;
    Ok(Json(pipeline::build_board(&stages, &cards, &reasons, &query)))
}

async fn get_summary(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let query = PipelineQuery::from_params(&params)?;
    let (stages, cards, reasons) = state.db.call(load_snapshot).await?;
    let visible = pipeline::filter_deals(&cards, &query.filter);
    Ok(Json(pipeline::summarize(&stages, &visible, &reasons)))
}

// Deals

async fn list_deals(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let query = PipelineQuery::from_params(&params)?;
    let cards = state.db.call(|db| db.list_deal_cards()).await?;
    let mut visible = pipeline::filter_deals(&cards, &query.filter);
    pipeline::sort_deals(&mut visible, query.sort, query.direction);
    Ok(Json(visible))
}

async fn create_deal(
    State(state): State<SharedState>,
    Json(req): Json<NewDeal>,
) -> Result<impl IntoResponse, ApiError> {
    let deal = state.db.call(move |db| db.create_deal(&req)).await?;
    tracing::info!(deal_id = deal.id, stage_id = deal.stage_id, "Deal created");
    broadcast_message(&state.ws_tx, &WsMessage::DealCreated { deal: deal.clone() });
    Ok((StatusCode::CREATED, Json(deal)))
}

async fn get_deal(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state.db.call(move |db| db.get_deal_detail(id)).await?;
    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(CrmError::DealNotFound { id }.into()),
    }
}

async fn update_deal(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(patch): Json<DealPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let deal = state.db.call(move |db| db.update_deal(id, &patch)).await?;
    broadcast_message(&state.ws_tx, &WsMessage::DealUpdated { deal: deal.clone() });
    Ok(Json(deal))
}

async fn delete_deal(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.call(move |db| db.delete_deal(id)).await?;
    match deleted {
        true => {
            tracing::info!(deal_id = id, "Deal deleted");
            broadcast_message(&state.ws_tx, &WsMessage::DealDeleted { deal_id: id });
            Ok(StatusCode::NO_CONTENT)
        }
        false => Err(CrmError::DealNotFound { id }.into()),
    }
}

fn broadcast_move(tx: &broadcast::Sender<String>, moved: &super::db::DealMove) {
    broadcast_message(
        tx,
        &WsMessage::DealMoved {
            deal_id: moved.deal.id,
            from_stage_id: moved.from_stage_id,
            to_stage_id: moved.deal.stage_id,
            position: moved.deal.position,
            status: moved.deal.status,
        },
    );
}

async fn move_deal(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<MoveDealRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let moved = state
        .db
        .call(move |db| db.move_deal(id, req.stage_id, req.position))
        .await?;
    tracing::debug!(
        deal_id = id,
        from_stage_id = moved.from_stage_id,
        to_stage_id = moved.deal.stage_id,
        "Deal moved"
    );
    broadcast_move(&state.ws_tx, &moved);
    Ok(Json(moved.deal))
}

async fn mark_won(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let moved = state.db.call(move |db| db.mark_won(id)).await?;
    tracing::info!(deal_id = id, "Deal won");
    broadcast_move(&state.ws_tx, &moved);
    Ok(Json(moved.deal))
}

async fn mark_lost(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<MarkLostRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let moved = state
        .db
        .call(move |db| db.mark_lost(id, req.loss_reason_id, req.note.as_deref()))
        .await?;
    tracing::info!(deal_id = id, loss_reason_id = req.loss_reason_id, "Deal lost");
    broadcast_move(&state.ws_tx, &moved);
    Ok(Json(moved.deal))
}

async fn reopen_deal(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(params): Query<ReopenParams>,
) -> Result<impl IntoResponse, ApiError> {
    let moved = state
        .db
        .call(move |db| db.reopen_deal(id, params.stage_id))
        .await?;
    broadcast_move(&state.ws_tx, &moved);
    Ok(Json(moved.deal))
}

// Lead activities

async fn list_activities(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let activities = state
        .db
        .call(move |db| {
            if db.get_deal(id)?.is_none() {
                return Err(CrmError::DealNotFound { id }.into());
            }
            db.list_activities(id)
        })
        .await?;
    Ok(Json(activities))
}

async fn add_activity(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<AddActivityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !req.kind.is_manual() {
        return Err(ApiError::BadRequest(format!(
            "Activity kind '{}' is recorded automatically",
            req.kind.as_str()
        )));
    }
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::BadRequest("Activity content must not be empty".into()));
    }
    let activity = state
        .db
        .call(move |db| {
            if db.get_deal(id)?.is_none() {
                return Err(CrmError::DealNotFound { id }.into());
            }
            db.add_activity(id, req.kind, &content)
        })
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::ActivityAdded {
            activity: activity.clone(),
        },
    );
    Ok((StatusCode::CREATED, Json(activity)))
}

// Contacts

async fn list_contacts(
    State(state): State<SharedState>,
    Query(params): Query<ContactSearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let contacts = state
        .db
        .call(move |db| db.list_contacts(params.search.as_deref()))
        .await?;
    Ok(Json(contacts))
}

async fn create_contact(
    State(state): State<SharedState>,
    Json(fields): Json<ContactFields>,
) -> Result<impl IntoResponse, ApiError> {
    let contact = state
        .db
        .call(move |db| db.create_contact(&fields, ContactSource::Manual, None))
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::ContactChanged {
            contact: contact.clone(),
        },
    );
    Ok((StatusCode::CREATED, Json(contact)))
}

async fn get_contact(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let contact = state.db.call(move |db| db.get_contact(id)).await?;
    match contact {
        Some(contact) => Ok(Json(contact)),
        None => Err(CrmError::ContactNotFound { id }.into()),
    }
}

async fn update_contact(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateContactRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let contact = state
        .db
        .call(move |db| {
            let current = db
                .get_contact(id)?
                .ok_or(CrmError::ContactNotFound { id })?;
            let fields = ContactFields {
                name: req.name.unwrap_or(current.name),
                email: req.email.unwrap_or(current.email),
                phone: req.phone.unwrap_or(current.phone),
                company: req.company.unwrap_or(current.company),
            };
            db.update_contact(id, &fields, None)
        })
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::ContactChanged {
            contact: contact.clone(),
        },
    );
    Ok(Json(contact))
}

async fn delete_contact(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.call(move |db| db.delete_contact(id)).await?;
    match deleted {
        true => {
            broadcast_message(&state.ws_tx, &WsMessage::ContactDeleted { contact_id: id });
            Ok(StatusCode::NO_CONTENT)
        }
        false => Err(CrmError::ContactNotFound { id }.into()),
    }
}

// Loss reasons

async fn list_loss_reasons(
    State(state): State<SharedState>,
    Query(params): Query<LossReasonListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let reasons = state
        .db
        .call(move |db| db.list_loss_reasons(params.include_inactive))
        .await?;
    Ok(Json(reasons))
}

async fn create_loss_reason(
    State(state): State<SharedState>,
    Json(req): Json<CreateLossReasonRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = state
        .db
        .call(move |db| db.create_loss_reason(&req.name))
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::LossReasonChanged {
            loss_reason: reason.clone(),
        },
    );
    Ok((StatusCode::CREATED, Json(reason)))
}

async fn update_loss_reason(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateLossReasonRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = state
        .db
        .call(move |db| db.update_loss_reason(id, req.name.as_deref(), req.active))
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::LossReasonChanged {
            loss_reason: reason.clone(),
        },
    );
    Ok(Json(reason))
}

async fn delete_loss_reason(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let (removal, reason) = state
        .db
        .call(move |db| {
            let removal = db.delete_loss_reason(id)?;
            Ok((removal, db.get_loss_reason(id)?))
        })
        .await?;
    match removal {
        None => Err(CrmError::LossReasonNotFound { id }.into()),
        Some(LossReasonRemoval::Deleted) => Ok(Json(serde_json::json!({"status": "deleted"}))),
        Some(LossReasonRemoval::Deactivated) => {
            if let Some(loss_reason) = reason {
                broadcast_message(&state.ws_tx, &WsMessage::LossReasonChanged { loss_reason });
            }
            Ok(Json(serde_json::json!({"status": "deactivated"})))
        }
    }
}

// Chatwoot settings and sync

fn load_chatwoot_view(
    db: &CrmDb,
    chatwoot: &ChatwootSection,
    sync_defaults: &SyncSection,
) -> anyhow::Result<ChatwootSettingsView> {
    let parse_i64 = |raw: Option<String>| raw.and_then(|v| v.trim().parse::<i64>().ok());
    let token = db
        .get_setting(sync::API_TOKEN_KEY)?
        .or_else(|| chatwoot.api_token.clone())
        .filter(|t| !t.is_empty());
    Ok(ChatwootSettingsView {
        base_url: db
            .get_setting(sync::BASE_URL_KEY)?
            .or_else(|| chatwoot.base_url.clone()),
        account_id: parse_i64(db.get_setting(sync::ACCOUNT_ID_KEY)?).or(chatwoot.account_id),
        inbox_id: parse_i64(db.get_setting(sync::INBOX_ID_KEY)?).or(chatwoot.inbox_id),
        api_token_configured: token.is_some(),
        api_token_preview: token.as_deref().map(mask_secret),
        create_deals: db
            .get_setting(sync::CREATE_DEALS_KEY)?
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(sync_defaults.create_deals),
        default_stage_id: parse_i64(db.get_setting(sync::DEFAULT_STAGE_KEY)?)
            .or(sync_defaults.default_stage_id),
    })
}

async fn get_chatwoot_settings(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let chatwoot = state.sync.chatwoot_defaults().clone();
    let sync_defaults = state.sync.sync_defaults().clone();
    let view = state
        .db
        .call(move |db| load_chatwoot_view(db, &chatwoot, &sync_defaults))
        .await?;
    Ok(Json(view))
}

async fn put_chatwoot_settings(
    State(state): State<SharedState>,
    Json(req): Json<UpdateChatwootSettingsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let base_url = match req.base_url.as_deref().map(str::trim) {
        Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
            return Err(ApiError::BadRequest(
                "base_url must start with http:// or https://".into(),
            ));
        }
        Some(url) => Some(url.trim_end_matches('/').to_string()),
        None => None,
    };
    if req.account_id.is_some_and(|id| id <= 0) {
        return Err(ApiError::BadRequest("account_id must be positive".into()));
    }

    let chatwoot = state.sync.chatwoot_defaults().clone();
    let sync_defaults = state.sync.sync_defaults().clone();
    let view = state
        .db
        .call(move |db| {
            db.transaction(|db| {
                if let Some(url) = &base_url {
                    db.set_setting(sync::BASE_URL_KEY, url)?;
                }
                if let Some(account_id) = req.account_id {
                    db.set_setting(sync::ACCOUNT_ID_KEY, &account_id.to_string())?;
                }
                match req.api_token.as_deref().map(str::trim) {
                    Some("") => db.delete_setting(sync::API_TOKEN_KEY)?,
                    Some(token) => db.set_setting(sync::API_TOKEN_KEY, token)?,
                    None => {}
                }
                match req.inbox_id {
                    Some(Some(inbox)) => db.set_setting(sync::INBOX_ID_KEY, &inbox.to_string())?,
                    Some(None) => db.delete_setting(sync::INBOX_ID_KEY)?,
                    None => {}
                }
                if let Some(create) = req.create_deals {
                    db.set_setting(sync::CREATE_DEALS_KEY, &create.to_string())?;
                }
                match req.default_stage_id {
                    Some(Some(stage_id)) => {
                        if db.get_stage(stage_id)?.is_none() {
                            return Err(CrmError::StageNotFound { id: stage_id }.into());
                        }
                        db.set_setting(sync::DEFAULT_STAGE_KEY, &stage_id.to_string())?;
                    }
                    Some(None) => db.delete_setting(sync::DEFAULT_STAGE_KEY)?,
                    None => {}
                }
                load_chatwoot_view(db, &chatwoot, &sync_defaults)
            })
        })
        .await?;
    tracing::info!(
        base_url = ?view.base_url,
        account_id = ?view.account_id,
        "Chatwoot settings updated"
    );
    Ok(Json(view))
}

async fn test_chatwoot(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let client = state.sync.client().await?;
    let profile = client.check_connection().await?;
    Ok(Json(serde_json::json!({"ok": true, "profile": profile})))
}

async fn sync_chatwoot(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let report = state.sync.run_now().await?;
    Ok(Json(report))
}

async fn chatwoot_status(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let (last_run_at, last_report, last_error) = state
        .db
        .call(|db| {
            Ok((
                db.get_setting(sync::LAST_RUN_KEY)?,
                db.get_setting(sync::LAST_REPORT_KEY)?,
                db.get_setting(sync::LAST_ERROR_KEY)?,
            ))
        })
        .await?;
    let last_report = match last_report {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable stored sync report");
                None
            }
        },
        None => None,
    };
    Ok(Json(SyncStatus {
        running: state.sync.is_running(),
        interval_secs: state.sync.interval_secs(),
        last_run_at,
        last_report,
        last_error,
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let db = CrmDb::new_in_memory().unwrap();
        db.seed_defaults().unwrap();
        let db = DbHandle::new(db);
        let (ws_tx, _) = broadcast::channel(16);
        let sync = SyncService::new(db.clone(), ChatwootSection::default(), SyncSection::default())
            .with_broadcast(ws_tx.clone());
        Arc::new(AppState { db, ws_tx, sync })
    }

    fn test_app() -> Router {
        api_router().with_state(test_state())
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn stage_id(app: &Router, name: &str) -> i64 {
        let (_, stages) = send(app, empty_request("GET", "/api/stages")).await;
        stages
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["name"] == name)
            .and_then(|s| s["id"].as_i64())
            .unwrap()
    }

    async fn create_deal(app: &Router, body: serde_json::Value) -> serde_json::Value {
        let (status, deal) = send(app, json_request("POST", "/api/deals", body)).await;
        assert_eq!(status, StatusCode::CREATED, "{deal}");
        deal
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_list_seeded_stages() {
        let app = test_app();
        let (status, stages) = send(&app, empty_request("GET", "/api/stages")).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = stages
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Lead", "Qualified", "Proposal", "Negotiation", "Won", "Lost"]);
    }

    #[tokio::test]
    async fn test_create_and_get_deal() {
        let app = test_app();
        let lead = stage_id(&app, "Lead").await;
        let deal = create_deal(
            &app,
            serde_json::json!({"title": "Website", "stage_id": lead, "value_cents": 250000, "tags": ["web"]}),
        )
        .await;
        assert_eq!(deal["status"], "open");
        assert_eq!(deal["currency"], "BRL");

        let uri = format!("/api/deals/{}", deal["id"]);
        let (status, detail) = send(&app, empty_request("GET", &uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["title"], "Website");
        assert_eq!(detail["stage"]["name"], "Lead");
        assert!(detail["activities"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_deal_returns_404_json() {
        let app = test_app();
        let (status, body) = send(&app, empty_request("GET", "/api/deals/999")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Deal 999 not found");
    }

    #[tokio::test]
    async fn test_create_deal_validation_errors() {
        let app = test_app();
        let lead = stage_id(&app, "Lead").await;

        let (status, body) = send(
            &app,
            json_request("POST", "/api/deals", serde_json::json!({"title": " ", "stage_id": lead})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("title"));

        let (status, _) = send(
            &app,
            json_request("POST", "/api/deals", serde_json::json!({"title": "X", "stage_id": 404})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_patch_deal_clears_owner() {
        let app = test_app();
        let lead = stage_id(&app, "Lead").await;
        let deal = create_deal(
            &app,
            serde_json::json!({"title": "Owned", "stage_id": lead, "owner": "rita"}),
        )
        .await;
        let uri = format!("/api/deals/{}", deal["id"]);

        let (status, updated) = send(
            &app,
            json_request("PATCH", &uri, serde_json::json!({"owner": null, "priority": "high"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(updated["owner"].is_null());
        assert_eq!(updated["priority"], "high");
        assert_eq!(updated["title"], "Owned");
    }

    #[tokio::test]
    async fn test_move_deal_into_won_stage_broadcasts() {
        let state = test_state();
        let mut rx = state.ws_tx.subscribe();
        let app = api_router().with_state(state);
        let lead = stage_id(&app, "Lead").await;
        let won = stage_id(&app, "Won").await;
        let deal = create_deal(&app, serde_json::json!({"title": "Closing", "stage_id": lead})).await;
        let created: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(created["type"], "DealCreated");

        let uri = format!("/api/deals/{}/move", deal["id"]);
        let (status, moved) = send(
            &app,
            json_request("PATCH", &uri, serde_json::json!({"stage_id": won, "position": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(moved["status"], "won");
        assert!(moved["closed_at"].is_string());

        let msg: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "DealMoved");
        assert_eq!(msg["data"]["from_stage_id"], lead);
        assert_eq!(msg["data"]["to_stage_id"], won);
        assert_eq!(msg["data"]["status"], "won");
    }

    #[tokio::test]
    async fn test_mark_lost_and_reopen() {
        let app = test_app();
        let lead = stage_id(&app, "Lead").await;
        let deal = create_deal(&app, serde_json::json!({"title": "Risky", "stage_id": lead})).await;
        let id = deal["id"].as_i64().unwrap();

        let (status, _) = send(
            &app,
            json_request(
                "POST",
                &format!("/api/deals/{}/lost", id),
                serde_json::json!({"loss_reason_id": 999}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, reasons) = send(&app, empty_request("GET", "/api/loss-reasons")).await;
        let reason_id = reasons[0]["id"].as_i64().unwrap();
        let (status, lost) = send(
            &app,
            json_request(
                "POST",
                &format!("/api/deals/{}/lost", id),
                serde_json::json!({"loss_reason_id": reason_id, "note": "Chose a competitor"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(lost["status"], "lost");
        assert_eq!(lost["loss_reason_id"], reason_id);

        let (status, reopened) =
            send(&app, empty_request("POST", &format!("/api/deals/{}/reopen", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reopened["status"], "open");
        assert_eq!(reopened["stage_id"], lead);

        let (status, _) =
            send(&app, empty_request("POST", &format!("/api/deals/{}/reopen", id))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, activities) =
            send(&app, empty_request("GET", &format!("/api/deals/{}/activities", id))).await;
        let kinds: Vec<&str> = activities
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["kind"].as_str().unwrap())
            .collect();
        assert!(kinds.contains(&"note"));
        assert!(kinds.contains(&"stage_change"));
        assert!(kinds.contains(&"status_change"));
    }

    #[tokio::test]
    async fn test_add_activity_rejects_system_kinds() {
        let app = test_app();
        let lead = stage_id(&app, "Lead").await;
        let deal = create_deal(&app, serde_json::json!({"title": "Calls", "stage_id": lead})).await;
        let uri = format!("/api/deals/{}/activities", deal["id"]);

        let (status, _) = send(
            &app,
            json_request("POST", &uri, serde_json::json!({"kind": "stage_change", "content": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, activity) = send(
            &app,
            json_request("POST", &uri, serde_json::json!({"kind": "call", "content": "Intro call"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(activity["kind"], "call");

        let (status, _) = send(
            &app,
            json_request(
                "POST",
                "/api/deals/999/activities",
                serde_json::json!({"kind": "note", "content": "x"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_board_filters_and_summary() {
        let app = test_app();
        let lead = stage_id(&app, "Lead").await;
        let won = stage_id(&app, "Won").await;
        create_deal(&app, serde_json::json!({"title": "Small", "stage_id": lead, "value_cents": 100})).await;
        create_deal(&app, serde_json::json!({"title": "Large", "stage_id": lead, "value_cents": 900})).await;
        create_deal(&app, serde_json::json!({"title": "Done", "stage_id": won, "value_cents": 500})).await;

        let (status, board) = send(
            &app,
            empty_request("GET", "/api/board?statuses=open&sort=value&dir=desc"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let columns = board["stages"].as_array().unwrap();
        assert_eq!(columns.len(), 6);
        let lead_titles: Vec<&str> = columns[0]["deals"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["title"].as_str().unwrap())
            .collect();
        assert_eq!(lead_titles, vec!["Large", "Small"]);
        assert_eq!(board["summary"]["total_deals"], 2);

        let (status, summary) = send(&app, empty_request("GET", "/api/pipeline/summary")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["total_deals"], 3);
        assert_eq!(summary["won_value_cents"], 500);
        assert_eq!(summary["win_rate_percent"], 100.0);

        let (status, list) = send(&app, empty_request("GET", "/api/deals?search=LAR")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_board_rejects_unknown_sort() {
        let app = test_app();
        let (status, body) = send(&app, empty_request("GET", "/api/board?sort=mood")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("sort"));
    }

    #[tokio::test]
    async fn test_stage_lifecycle() {
        let app = test_app();
        let lead = stage_id(&app, "Lead").await;
        let qualified = stage_id(&app, "Qualified").await;
        create_deal(&app, serde_json::json!({"title": "Blocker", "stage_id": lead})).await;

        let (status, _) = send(&app, empty_request("DELETE", &format!("/api/stages/{}", lead))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &app,
            empty_request("DELETE", &format!("/api/stages/{}?move_to={}", lead, qualified)),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, stage) = send(
            &app,
            json_request("POST", "/api/stages", serde_json::json!({"name": "Demo", "color": "#123456"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(stage["kind"], "open");

        let (_, stages) = send(&app, empty_request("GET", "/api/stages")).await;
        let mut ids: Vec<i64> = stages
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_i64().unwrap())
            .collect();
        ids.rotate_left(1);
        let (status, reordered) = send(
            &app,
            json_request("PUT", "/api/stages/reorder", serde_json::json!({"stage_ids": ids})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reordered[0]["id"], ids[0]);

        let (status, _) = send(
            &app,
            json_request("PUT", "/api/stages/reorder", serde_json::json!({"stage_ids": [ids[0]]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_contact_crud() {
        let app = test_app();
        let (status, contact) = send(
            &app,
            json_request(
                "POST",
                "/api/contacts",
                serde_json::json!({"name": "Ana", "email": "ana@acme.com", "company": "Acme"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(contact["source"], "manual");
        let uri = format!("/api/contacts/{}", contact["id"]);

        let (status, updated) =
            send(&app, json_request("PATCH", &uri, serde_json::json!({"company": null}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(updated["company"].is_null());
        assert_eq!(updated["email"], "ana@acme.com");

        let (_, found) = send(&app, empty_request("GET", "/api/contacts?search=acme.com")).await;
        assert_eq!(found.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, empty_request("GET", &uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_loss_reason_delete_or_deactivate() {
        let app = test_app();
        let (status, reason) = send(
            &app,
            json_request("POST", "/api/loss-reasons", serde_json::json!({"name": "Legal"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send(
            &app,
            json_request("POST", "/api/loss-reasons", serde_json::json!({"name": "legal"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let lead = stage_id(&app, "Lead").await;
        let deal = create_deal(&app, serde_json::json!({"title": "Blocked", "stage_id": lead})).await;
        send(
            &app,
            json_request(
                "POST",
                &format!("/api/deals/{}/lost", deal["id"]),
                serde_json::json!({"loss_reason_id": reason["id"]}),
            ),
        )
        .await;

        let uri = format!("/api/loss-reasons/{}", reason["id"]);
        let (status, body) = send(&app, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "deactivated");

        let (_, active) = send(&app, empty_request("GET", "/api/loss-reasons")).await;
        assert!(active.as_array().unwrap().iter().all(|r| r["name"] != "Legal"));
        let (_, all) = send(&app, empty_request("GET", "/api/loss-reasons?include_inactive=true")).await;
        assert!(all.as_array().unwrap().iter().any(|r| r["name"] == "Legal"));
    }

    #[tokio::test]
    async fn test_chatwoot_settings_are_masked() {
        let app = test_app();
        let (status, view) = send(&app, empty_request("GET", "/api/settings/chatwoot")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["api_token_configured"], false);

        let (status, view) = send(
            &app,
            json_request(
                "PUT",
                "/api/settings/chatwoot",
                serde_json::json!({
                    "base_url": "https://chat.example.com/",
                    "account_id": 2,
                    "api_token": "supersecret9876",
                    "create_deals": true
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["base_url"], "https://chat.example.com");
        assert_eq!(view["account_id"], 2);
        assert_eq!(view["api_token_configured"], true);
        assert_eq!(view["api_token_preview"], "***********9876");
        assert_eq!(view["create_deals"], true);
        assert!(!view.to_string().contains("supersecret"));

        let (status, _) = send(
            &app,
            json_request("PUT", "/api/settings/chatwoot", serde_json::json!({"base_url": "ftp://x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            json_request("PUT", "/api/settings/chatwoot", serde_json::json!({"default_stage_id": 999})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sync_without_configuration_is_bad_request() {
        let app = test_app();
        let (status, body) = send(&app, empty_request("POST", "/api/chatwoot/sync")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("not configured"));

        let (status, status_body) = send(&app, empty_request("GET", "/api/chatwoot/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(status_body["running"], false);
        assert!(status_body["last_report"].is_null());
        assert!(status_body["last_error"].as_str().unwrap().contains("not configured"));
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            ApiError::from(CrmError::SyncInProgress),
            ApiError::Conflict(_)
        ));
        assert!(matches!(
            ApiError::from(CrmError::ChatwootAuth),
            ApiError::BadGateway(_)
        ));
        assert!(matches!(
            ApiError::from(anyhow::Error::from(CrmError::StageNotFound { id: 1 })),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(anyhow::anyhow!("disk full")),
            ApiError::Internal(_)
        ));
    }
}
