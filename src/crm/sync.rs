//! Chatwoot → local contact reconciliation.
//!
//! A sync is three steps: fetch every remote contact, [`plan_sync`] against
//! the local table (pure, no I/O), then [`apply_sync`] the plan in a single
//! transaction. [`SyncService`] wraps the whole run with a single-flight
//! guard shared by the HTTP endpoint, the CLI and [`SyncScheduler`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::chatwoot::{ChatwootClient, ChatwootConfig, ChatwootContact};
use super::db::{CrmDb, DbHandle};
use super::models::{ActivityKind, Contact, ContactFields, ContactSource, NewDeal, StageKind};
use super::ws::{WsMessage, broadcast_message};
use crate::config::{ChatwootSection, SyncSection};
use crate::errors::CrmError;

/// Settings keys written by a sync run.
pub const LAST_RUN_KEY: &str = "sync.last_run_at";
pub const LAST_REPORT_KEY: &str = "sync.last_report";
pub const LAST_ERROR_KEY: &str = "sync.last_error";

/// Settings keys that override the file configuration.
pub const BASE_URL_KEY: &str = "chatwoot.base_url";
pub const ACCOUNT_ID_KEY: &str = "chatwoot.account_id";
pub const API_TOKEN_KEY: &str = "chatwoot.api_token";
pub const INBOX_ID_KEY: &str = "chatwoot.inbox_id";
pub const CREATE_DEALS_KEY: &str = "sync.create_deals";
pub const DEFAULT_STAGE_KEY: &str = "sync.default_stage_id";

const MIN_PHONE_DIGITS: usize = 8;

/// Lowercased, trimmed email; `None` when blank.
pub fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim().to_lowercase();
    if email.is_empty() { None } else { Some(email) }
}

/// Digits with an optional leading `+`; `None` below eight digits.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let trimmed = phone.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < MIN_PHONE_DIGITS {
        return None;
    }
    if trimmed.starts_with('+') {
        Some(format!("+{}", digits))
    } else {
        Some(digits)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// What to do with one remote contact.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    Create {
        remote_id: i64,
        fields: ContactFields,
    },
    Update {
        contact_id: i64,
        remote_id: i64,
        fields: ContactFields,
    },
    Unchanged {
        contact_id: i64,
        remote_id: i64,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    pub actions: Vec<SyncAction>,
    /// Remote contacts considered, duplicates included
    pub total_remote: usize,
    pub duplicates_skipped: usize,
}

impl SyncPlan {
    pub fn count_creates(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, SyncAction::Create { .. }))
            .count()
    }

    pub fn count_updates(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, SyncAction::Update { .. }))
            .count()
    }
}

/// Name for a brand new contact: the remote name, else whatever identifies it.
fn display_name(remote: &ChatwootContact) -> String {
    non_blank(remote.name.as_deref())
        .or_else(|| non_blank(remote.email.as_deref()))
        .or_else(|| non_blank(remote.phone_number.as_deref()))
        .or_else(|| non_blank(remote.identifier.as_deref()))
        .map(str::to_string)
        .unwrap_or_else(|| format!("Chatwoot contact #{}", remote.id))
}

/// Overlay non-blank remote values on the local record. Values that only
/// differ after normalisation keep their local spelling.
fn merge_fields(local: &Contact, remote: &ChatwootContact) -> ContactFields {
    let name = non_blank(remote.name.as_deref())
        .map(str::to_string)
        .unwrap_or_else(|| local.name.clone());

    let email = match remote.email.as_deref().and_then(normalize_email) {
        Some(remote_email)
            if local.email.as_deref().and_then(normalize_email).as_ref() != Some(&remote_email) =>
        {
            Some(remote_email)
        }
        _ => local.email.clone(),
    };

    let phone = match non_blank(remote.phone_number.as_deref()) {
        Some(remote_phone)
            if normalize_phone(remote_phone).is_none()
                || local.phone.as_deref().and_then(normalize_phone)
                    != normalize_phone(remote_phone) =>
        {
            Some(remote_phone.to_string())
        }
        _ => local.phone.clone(),
    };

    let company = non_blank(remote.company_name())
        .map(str::to_string)
        .or_else(|| local.company.clone());

    ContactFields {
        name,
        email,
        phone,
        company,
    }
}

fn local_fields(contact: &Contact) -> ContactFields {
    ContactFields {
        name: contact.name.clone(),
        email: contact.email.clone(),
        phone: contact.phone.clone(),
        company: contact.company.clone(),
    }
}

/// Decide, for every remote contact, whether to create, update or leave a
/// local contact. Matching tries `chatwoot_id`, then email, then phone; a
/// local contact already linked to another Chatwoot id never matches by
/// email or phone, and each local contact is claimed at most once.
pub fn plan_sync(local: &[Contact], remote: &[ChatwootContact]) -> SyncPlan {
    let mut by_remote_id: HashMap<i64, usize> = HashMap::new();
    let mut by_email: HashMap<String, Vec<usize>> = HashMap::new();
    let mut by_phone: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, contact) in local.iter().enumerate() {
        if let Some(cw) = contact.chatwoot_id {
            by_remote_id.entry(cw).or_insert(idx);
        }
        if let Some(email) = contact.email.as_deref().and_then(normalize_email) {
            by_email.entry(email).or_default().push(idx);
        }
        if let Some(phone) = contact.phone.as_deref().and_then(normalize_phone) {
            by_phone.entry(phone).or_default().push(idx);
        }
    }

    let mut plan = SyncPlan {
        total_remote: remote.len(),
        ..SyncPlan::default()
    };
    let mut seen_remote: HashSet<i64> = HashSet::new();
    let mut claimed: HashSet<usize> = HashSet::new();

    for contact in remote {
        if !seen_remote.insert(contact.id) {
            plan.duplicates_skipped += 1;
            continue;
        }

        let eligible = |idx: &usize| {
            !claimed.contains(idx)
                && local[*idx]
                    .chatwoot_id
                    .is_none_or(|linked| linked == contact.id)
        };
        let pick = |candidates: Option<&Vec<usize>>| {
            candidates.and_then(|ids| ids.iter().copied().find(|idx| eligible(idx)))
        };

        let matched = by_remote_id
            .get(&contact.id)
            .copied()
            .filter(|idx| !claimed.contains(idx))
            .or_else(|| {
                let email = contact.email.as_deref().and_then(normalize_email)?;
                pick(by_email.get(&email))
            })
            .or_else(|| {
                let phone = contact.phone_number.as_deref().and_then(normalize_phone)?;
                pick(by_phone.get(&phone))
            });

        let action = match matched {
            Some(idx) => {
                claimed.insert(idx);
                let existing = &local[idx];
                let fields = merge_fields(existing, contact);
                if fields != local_fields(existing) || existing.chatwoot_id != Some(contact.id) {
                    SyncAction::Update {
                        contact_id: existing.id,
                        remote_id: contact.id,
                        fields,
                    }
                } else {
                    SyncAction::Unchanged {
                        contact_id: existing.id,
                        remote_id: contact.id,
                    }
                }
            }
            None => SyncAction::Create {
                remote_id: contact.id,
                fields: ContactFields {
                    name: display_name(contact),
                    email: contact.email.as_deref().and_then(normalize_email),
                    phone: non_blank(contact.phone_number.as_deref()).map(str::to_string),
                    company: non_blank(contact.company_name()).map(str::to_string),
                },
            },
        };
        plan.actions.push(action);
    }

    plan
}

/// Options for applying a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub create_deals: bool,
    pub default_stage_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub total_remote: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deals_created: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Write a plan to the store in one transaction and report what changed.
pub fn apply_sync(db: &CrmDb, plan: &SyncPlan, options: &SyncOptions) -> Result<SyncReport> {
    let started_at = Utc::now();
    db.transaction(|db| {
        let mut report = SyncReport {
            total_remote: plan.total_remote,
            created: 0,
            updated: 0,
            unchanged: 0,
            deals_created: 0,
            started_at,
            finished_at: started_at,
        };

        let deal_stage_id = if options.create_deals && plan.count_creates() > 0 {
            resolve_deal_stage(db, options.default_stage_id)?
        } else {
            None
        };

        for action in &plan.actions {
            match action {
                SyncAction::Create { remote_id, fields } => {
                    let contact =
                        db.create_contact(fields, ContactSource::Chatwoot, Some(*remote_id))?;
                    db.mark_contact_synced(contact.id)?;
                    report.created += 1;

                    if let Some(stage_id) = deal_stage_id {
                        let deal = db.create_deal(&NewDeal {
                            title: contact.name.clone(),
                            stage_id,
                            contact_id: Some(contact.id),
                            ..NewDeal::default()
                        })?;
                        db.add_activity(
                            deal.id,
                            ActivityKind::Sync,
                            &format!("Created from Chatwoot contact #{}", remote_id),
                        )?;
                        report.deals_created += 1;
                    }
                }
                SyncAction::Update {
                    contact_id,
                    remote_id,
                    fields,
                } => {
                    db.update_contact(*contact_id, fields, Some(*remote_id))?;
                    db.mark_contact_synced(*contact_id)?;
                    report.updated += 1;
                }
                SyncAction::Unchanged { contact_id, .. } => {
                    db.mark_contact_synced(*contact_id)?;
                    report.unchanged += 1;
                }
            }
        }

        report.finished_at = Utc::now();
        Ok(report)
    })
}

/// The configured stage if it exists, else the first open stage.
fn resolve_deal_stage(db: &CrmDb, configured: Option<i64>) -> Result<Option<i64>> {
    if let Some(stage_id) = configured {
        if db.get_stage(stage_id)?.is_some() {
            return Ok(Some(stage_id));
        }
        tracing::warn!(stage_id, "Configured sync stage does not exist, using first open stage");
    }
    let fallback = db.first_stage_of_kind(StageKind::Open)?.map(|s| s.id);
    if fallback.is_none() {
        tracing::warn!("No open stage available, skipping deal creation for synced contacts");
    }
    Ok(fallback)
}

/// Fetch, plan and apply, then record the outcome in settings.
pub async fn run_sync(
    db: &DbHandle,
    client: &ChatwootClient,
    options: SyncOptions,
    max_pages: u32,
) -> Result<SyncReport> {
    let started_at = Utc::now();
    let remote = client.list_all_contacts(max_pages).await?;
    tracing::info!(fetched = remote.len(), "Fetched Chatwoot contacts");

    db.call(move |db| {
        let local = db.list_contacts(None)?;
        let plan = plan_sync(&local, &remote);
        if plan.duplicates_skipped > 0 {
            tracing::debug!(duplicates = plan.duplicates_skipped, "Skipped duplicate remote contacts");
        }
        let mut report = apply_sync(db, &plan, &options)?;
        report.started_at = started_at;

        db.set_setting(LAST_RUN_KEY, &report.finished_at.to_rfc3339())?;
        db.set_setting(
            LAST_REPORT_KEY,
            &serde_json::to_string(&report).context("Failed to serialize sync report")?,
        )?;
        db.delete_setting(LAST_ERROR_KEY)?;
        Ok(report)
    })
    .await
}

/// Settings-table overrides layered over the file configuration.
#[derive(Debug, Clone)]
pub struct ResolvedSync {
    pub connection: ChatwootConfig,
    pub options: SyncOptions,
}

/// Merge stored settings over file defaults. Fails with
/// `ChatwootNotConfigured` when no usable connection is available.
pub fn resolve_sync_settings(
    db: &CrmDb,
    chatwoot: &ChatwootSection,
    sync: &SyncSection,
) -> Result<ResolvedSync> {
    let base_url = db
        .get_setting(BASE_URL_KEY)?
        .or_else(|| chatwoot.base_url.clone());
    let api_token = db
        .get_setting(API_TOKEN_KEY)?
        .or_else(|| chatwoot.api_token.clone());
    let account_id = match db.get_setting(ACCOUNT_ID_KEY)? {
        Some(raw) => Some(parse_setting::<i64>(ACCOUNT_ID_KEY, &raw)?),
        None => chatwoot.account_id,
    };
    let inbox_id = match db.get_setting(INBOX_ID_KEY)? {
        Some(raw) => Some(parse_setting::<i64>(INBOX_ID_KEY, &raw)?),
        None => chatwoot.inbox_id,
    };
    let create_deals = match db.get_setting(CREATE_DEALS_KEY)? {
        Some(raw) => parse_setting::<bool>(CREATE_DEALS_KEY, &raw)?,
        None => sync.create_deals,
    };
    let default_stage_id = match db.get_setting(DEFAULT_STAGE_KEY)? {
        Some(raw) => Some(parse_setting::<i64>(DEFAULT_STAGE_KEY, &raw)?),
        None => sync.default_stage_id,
    };

    let (Some(base_url), Some(account_id), Some(api_token)) = (base_url, account_id, api_token)
    else {
        return Err(CrmError::ChatwootNotConfigured(
            "base URL, account id and API token are required".into(),
        )
        .into());
    };

    Ok(ResolvedSync {
        connection: ChatwootConfig {
            base_url,
            account_id,
            api_token,
            inbox_id,
        }
        .normalized()?,
        options: SyncOptions {
            create_deals,
            default_stage_id,
        },
    })
}

fn parse_setting<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| CrmError::Config(format!("Setting {} has an invalid value '{}'", key, raw)).into())
}

/// Resets the running flag when a sync finishes, however it finishes.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Shared entry point for every sync trigger. Only one sync runs at a time.
#[derive(Clone)]
pub struct SyncService {
    db: DbHandle,
    chatwoot: ChatwootSection,
    sync: SyncSection,
    running: Arc<AtomicBool>,
    ws_tx: Option<broadcast::Sender<String>>,
}

impl SyncService {
    pub fn new(db: DbHandle, chatwoot: ChatwootSection, sync: SyncSection) -> Self {
        Self {
            db,
            chatwoot,
            sync,
            running: Arc::new(AtomicBool::new(false)),
            ws_tx: None,
        }
    }

    /// Announce sync lifecycle events on a WebSocket broadcast channel.
    pub fn with_broadcast(mut self, tx: broadcast::Sender<String>) -> Self {
        self.ws_tx = Some(tx);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn interval_secs(&self) -> u64 {
        self.sync.interval_secs
    }

    /// Connection defaults from the config file.
    pub fn chatwoot_defaults(&self) -> &ChatwootSection {
        &self.chatwoot
    }

    pub fn sync_defaults(&self) -> &SyncSection {
        &self.sync
    }

    /// Current connection and options, settings table first.
    pub async fn resolve(&self) -> Result<ResolvedSync> {
        let chatwoot = self.chatwoot.clone();
        let sync = self.sync.clone();
        self.db
            .call(move |db| resolve_sync_settings(db, &chatwoot, &sync))
            .await
    }

    /// Build a client from the resolved settings.
    pub async fn client(&self) -> Result<ChatwootClient> {
        let resolved = self.resolve().await?;
        ChatwootClient::new(
            resolved.connection,
            Duration::from_secs(self.chatwoot.timeout_secs),
        )
    }

    /// Run one sync now. Fails with `SyncInProgress` if another is running.
    pub async fn run_now(&self) -> Result<SyncReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CrmError::SyncInProgress.into());
        }
        let _guard = RunningGuard(self.running.clone());

        self.broadcast(&WsMessage::SyncStarted);
        tracing::info!("Chatwoot contact sync started");

        match self.run_inner().await {
            Ok(report) => {
                tracing::info!(
                    total_remote = report.total_remote,
                    created = report.created,
                    updated = report.updated,
                    unchanged = report.unchanged,
                    deals_created = report.deals_created,
                    "Chatwoot contact sync completed"
                );
                self.broadcast(&WsMessage::SyncCompleted {
                    report: report.clone(),
                });
                Ok(report)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!(error = %message, "Chatwoot contact sync failed");
                let stored = message.clone();
                if let Err(record_err) = self
                    .db
                    .call(move |db| db.set_setting(LAST_ERROR_KEY, &stored))
                    .await
                {
                    tracing::warn!(error = %record_err, "Failed to record sync error");
                }
                self.broadcast(&WsMessage::SyncFailed { error: message });
                Err(e)
            }
        }
    }

    async fn run_inner(&self) -> Result<SyncReport> {
        let resolved = self.resolve().await?;
        let client = ChatwootClient::new(
            resolved.connection,
            Duration::from_secs(self.chatwoot.timeout_secs),
        )?;
        run_sync(&self.db, &client, resolved.options, self.chatwoot.max_pages).await
    }

    fn broadcast(&self, msg: &WsMessage) {
        if let Some(tx) = &self.ws_tx {
            broadcast_message(tx, msg);
        }
    }
}

/// Runs [`SyncService::run_now`] on a fixed interval.
pub struct SyncScheduler {
    service: SyncService,
    interval: Duration,
}

impl SyncScheduler {
    /// `None` when `interval_secs` is 0.
    pub fn new(service: SyncService, interval_secs: u64) -> Option<Self> {
        (interval_secs > 0).then(|| Self {
            service,
            interval: Duration::from_secs(interval_secs),
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick is immediate; the first sync waits one interval.
            ticker.tick().await;
            tracing::info!(interval_secs = self.interval.as_secs(), "Sync scheduler started");

            loop {
                ticker.tick().await;
                // Failures are already logged and recorded by run_now
                if let Err(e) = self.service.run_now().await
                    && matches!(e.downcast_ref::<CrmError>(), Some(CrmError::SyncInProgress))
                {
                    tracing::debug!("Scheduled sync skipped, another sync is running");
                }
            }
        })
    }
}
