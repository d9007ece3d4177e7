use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use crate::errors::CrmError;

/// Async-safe handle to the CRM database.
///
/// Wraps `CrmDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CrmDb>>,
}

impl DbHandle {
    pub fn new(db: CrmDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CrmDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| CrmError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests;
    /// never call this from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, CrmDb>> {
        self.inner.lock().map_err(|_| CrmError::LockPoisoned.into())
    }
}

/// Outcome of deleting a loss reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReasonRemoval {
    Deleted,
    /// Still referenced by deals, so it was only deactivated.
    Deactivated,
}

/// Result of moving a deal between (or within) stages.
#[derive(Debug, Clone)]
pub struct DealMove {
    pub deal: Deal,
    pub from_stage_id: i64,
}

const DEFAULT_STAGES: &[(&str, &str, StageKind)] = &[
    ("Lead", "#94a3b8", StageKind::Open),
    ("Qualified", "#60a5fa", StageKind::Open),
    ("Proposal", "#a78bfa", StageKind::Open),
    ("Negotiation", "#f59e0b", StageKind::Open),
    ("Won", "#22c55e", StageKind::Won),
    ("Lost", "#ef4444", StageKind::Lost),
];

const DEFAULT_LOSS_REASONS: &[&str] = &["Price", "Competitor", "No budget", "No response", "Timing"];

/// Upper bound for a single deal value: ten trillion units of currency.
pub const MAX_VALUE_CENTS: i64 = 1_000_000_000_000_000;

const DEAL_COLUMNS: &str = "id, title, value_cents, currency, stage_id, contact_id, owner, priority, status, loss_reason_id, expected_close_date, position, tags, notes, created_at, updated_at, closed_at";

const CONTACT_COLUMNS: &str =
    "id, name, email, phone, company, chatwoot_id, source, created_at, updated_at, last_synced_at";

pub struct CrmDb {
    conn: Connection,
}

impl CrmDb {
    /// Open (or create) a SQLite database at the given path and create the schema.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.create_schema().context("Failed to create schema")?;
        Ok(())
    }

    fn create_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS pipeline_stages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    position INTEGER NOT NULL DEFAULT 0,
                    color TEXT,
                    kind TEXT NOT NULL DEFAULT 'open',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS contacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    email TEXT,
                    phone TEXT,
                    company TEXT,
                    chatwoot_id INTEGER UNIQUE,
                    source TEXT NOT NULL DEFAULT 'manual',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    last_synced_at TEXT
                );

                CREATE TABLE IF NOT EXISTS loss_reasons (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS deals (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    value_cents INTEGER NOT NULL DEFAULT 0,
                    currency TEXT NOT NULL DEFAULT 'BRL',
                    stage_id INTEGER NOT NULL REFERENCES pipeline_stages(id),
                    contact_id INTEGER REFERENCES contacts(id) ON DELETE SET NULL,
                    owner TEXT,
                    priority TEXT NOT NULL DEFAULT 'medium',
                    status TEXT NOT NULL DEFAULT 'open',
                    loss_reason_id INTEGER REFERENCES loss_reasons(id),
                    expected_close_date TEXT,
                    position INTEGER NOT NULL DEFAULT 0,
                    tags TEXT NOT NULL DEFAULT '[]',
                    notes TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    closed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS lead_activities (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    deal_id INTEGER NOT NULL REFERENCES deals(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_deals_stage ON deals(stage_id, position);
                CREATE INDEX IF NOT EXISTS idx_deals_contact ON deals(contact_id);
                CREATE INDEX IF NOT EXISTS idx_activities_deal ON lead_activities(deal_id);
                CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Run `f` atomically. A call made while a transaction is already open
    /// joins it instead of nesting.
    pub fn transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        if !self.conn.is_autocommit() {
            return f(self);
        }
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let value = f(self)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(value)
    }

    /// Insert the default stages and loss reasons into empty tables.
    /// Returns true when anything was inserted.
    pub fn seed_defaults(&self) -> Result<bool> {
        self.transaction(|db| {
            let mut seeded = false;
            let stage_count: i64 =
                db.conn
                    .query_row("SELECT COUNT(*) FROM pipeline_stages", [], |row| row.get(0))?;
            if stage_count == 0 {
                for (name, color, kind) in DEFAULT_STAGES {
                    db.create_stage(name, Some(color), *kind)?;
                }
                seeded = true;
            }
            let reason_count: i64 =
                db.conn
                    .query_row("SELECT COUNT(*) FROM loss_reasons", [], |row| row.get(0))?;
            if reason_count == 0 {
                for name in DEFAULT_LOSS_REASONS {
                    db.create_loss_reason(name)?;
                }
                seeded = true;
            }
            Ok(seeded)
        })
    }

    // ── Pipeline stages ───────────────────────────────────────────────

    pub fn list_stages(&self) -> Result<Vec<PipelineStage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, position, color, kind, created_at
                 FROM pipeline_stages ORDER BY position, id",
            )
            .context("Failed to prepare list_stages")?;
        let rows = stmt
            .query_map([], StageRow::from_row)
            .context("Failed to query stages")?;
        let mut stages = Vec::new();
        for row in rows {
            stages.push(row.context("Failed to read stage row")?.into_stage()?);
        }
        Ok(stages)
    }

    pub fn get_stage(&self, id: i64) -> Result<Option<PipelineStage>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, position, color, kind, created_at
                 FROM pipeline_stages WHERE id = ?1",
                params![id],
                StageRow::from_row,
            )
            .optional()
            .context("Failed to query stage")?;
        row.map(StageRow::into_stage).transpose()
    }

    fn require_stage(&self, id: i64) -> Result<PipelineStage> {
        self.get_stage(id)?
            .ok_or_else(|| CrmError::StageNotFound { id }.into())
    }

    /// First stage of the given kind in board order.
    pub fn first_stage_of_kind(&self, kind: StageKind) -> Result<Option<PipelineStage>> {
        Ok(self.list_stages()?.into_iter().find(|s| s.kind == kind))
    }

    pub fn create_stage(
        &self,
        name: &str,
        color: Option<&str>,
        kind: StageKind,
    ) -> Result<PipelineStage> {
        let name = validate_name(name, "Stage name")?;
        let max_pos: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM pipeline_stages",
                [],
                |row| row.get(0),
            )
            .context("Failed to get max stage position")?;
        self.conn
            .execute(
                "INSERT INTO pipeline_stages (name, position, color, kind) VALUES (?1, ?2, ?3, ?4)",
                params![name, max_pos + 1, color, kind.as_str()],
            )
            .context("Failed to insert stage")?;
        let id = self.conn.last_insert_rowid();
        self.get_stage(id)?.context("Stage not found after insert")
    }

    pub fn update_stage(
        &self,
        id: i64,
        name: Option<&str>,
        color: Option<&str>,
        kind: Option<StageKind>,
    ) -> Result<PipelineStage> {
        self.transaction(|db| {
            let current = db.require_stage(id)?;
            let name = match name {
                Some(n) => validate_name(n, "Stage name")?,
                None => current.name,
            };
            let color = color.map(str::to_string).or(current.color);
            let kind = kind.unwrap_or(current.kind);
            db.conn
                .execute(
                    "UPDATE pipeline_stages SET name = ?1, color = ?2, kind = ?3 WHERE id = ?4",
                    params![name, color, kind.as_str(), id],
                )
                .context("Failed to update stage")?;

            // Deals in the stage take the status of its new kind
            if kind != current.kind {
                let status = kind.deal_status();
                for deal_id in db.deal_ids_in_stage(id)? {
                    if db.require_deal(deal_id)?.status != status {
                        db.set_status(deal_id, status)?;
                    }
                }
            }
            db.require_stage(id)
        })
    }

    /// Reassign stage positions from the given id order. The ids must be a
    /// permutation of every existing stage.
    pub fn reorder_stages(&self, ordered_ids: &[i64]) -> Result<Vec<PipelineStage>> {
        self.transaction(|db| {
            let mut existing: Vec<i64> = db.list_stages()?.iter().map(|s| s.id).collect();
            let mut requested = ordered_ids.to_vec();
            existing.sort_unstable();
            requested.sort_unstable();
            if existing != requested {
                return Err(CrmError::BadRequest(
                    "Stage order must list every stage exactly once".into(),
                )
                .into());
            }
            for (position, stage_id) in ordered_ids.iter().enumerate() {
                db.conn
                    .execute(
                        "UPDATE pipeline_stages SET position = ?1 WHERE id = ?2",
                        params![position as i32, stage_id],
                    )
                    .context("Failed to update stage position")?;
            }
            db.list_stages()
        })
    }

    /// Delete a stage. Deals still in it are moved to `move_to` first; without
    /// a target the delete is refused.
    pub fn delete_stage(&self, id: i64, move_to: Option<i64>) -> Result<bool> {
        self.transaction(|db| {
            if db.get_stage(id)?.is_none() {
                return Ok(false);
            }
            let deal_ids = db.deal_ids_in_stage(id)?;
            if !deal_ids.is_empty() {
                let target = match move_to {
                    None => {
                        return Err(CrmError::Conflict(format!(
                            "Stage {} still holds {} deal(s); pass a target stage to move them",
                            id,
                            deal_ids.len()
                        ))
                        .into());
                    }
                    Some(target) if target == id => {
                        return Err(CrmError::BadRequest(
                            "Cannot move deals into the stage being deleted".into(),
                        )
                        .into());
                    }
                    Some(target) => target,
                };
                db.require_stage(target)?;
                for deal_id in deal_ids {
                    db.move_deal(deal_id, target, i32::MAX)?;
                }
            }
            db.conn
                .execute("DELETE FROM pipeline_stages WHERE id = ?1", params![id])
                .context("Failed to delete stage")?;
            let remaining: Vec<i64> = db.list_stages()?.iter().map(|s| s.id).collect();
            db.reorder_stages(&remaining)?;
            Ok(true)
        })
    }

    // ── Contacts ──────────────────────────────────────────────────────

    /// List contacts by name, optionally narrowed by a case-insensitive
    /// substring over name, email, phone and company.
    pub fn list_contacts(&self, search: Option<&str>) -> Result<Vec<Contact>> {
        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s.to_lowercase()));
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE ?1 IS NULL
                OR lower(name) LIKE ?1
                OR lower(COALESCE(email, '')) LIKE ?1
                OR lower(COALESCE(phone, '')) LIKE ?1
                OR lower(COALESCE(company, '')) LIKE ?1
             ORDER BY name COLLATE NOCASE, id"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_contacts")?;
        let rows = stmt
            .query_map(params![pattern], ContactRow::from_row)
            .context("Failed to query contacts")?;
        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row.context("Failed to read contact row")?.into_contact()?);
        }
        Ok(contacts)
    }

    pub fn get_contact(&self, id: i64) -> Result<Option<Contact>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id],
                ContactRow::from_row,
            )
            .optional()
            .context("Failed to query contact")?;
        row.map(ContactRow::into_contact).transpose()
    }

    pub fn create_contact(
        &self,
        fields: &ContactFields,
        source: ContactSource,
        chatwoot_id: Option<i64>,
    ) -> Result<Contact> {
        let name = validate_name(&fields.name, "Contact name")?;
        self.conn
            .execute(
                "INSERT INTO contacts (name, email, phone, company, chatwoot_id, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    name,
                    blank_to_none(fields.email.as_deref()),
                    blank_to_none(fields.phone.as_deref()),
                    blank_to_none(fields.company.as_deref()),
                    chatwoot_id,
                    source.as_str()
                ],
            )
            .context("Failed to insert contact")?;
        let id = self.conn.last_insert_rowid();
        self.get_contact(id)?.context("Contact not found after insert")
    }

    /// Overwrite a contact's fields. `chatwoot_id` is only written when given.
    pub fn update_contact(
        &self,
        id: i64,
        fields: &ContactFields,
        chatwoot_id: Option<i64>,
    ) -> Result<Contact> {
        let name = validate_name(&fields.name, "Contact name")?;
        let count = self
            .conn
            .execute(
                "UPDATE contacts
                 SET name = ?1, email = ?2, phone = ?3, company = ?4,
                     chatwoot_id = COALESCE(?5, chatwoot_id), updated_at = datetime('now')
                 WHERE id = ?6",
                params![
                    name,
                    blank_to_none(fields.email.as_deref()),
                    blank_to_none(fields.phone.as_deref()),
                    blank_to_none(fields.company.as_deref()),
                    chatwoot_id,
                    id
                ],
            )
            .context("Failed to update contact")?;
        if count == 0 {
            return Err(CrmError::ContactNotFound { id }.into());
        }
        self.get_contact(id)?.context("Contact not found after update")
    }

    pub fn mark_contact_synced(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE contacts SET last_synced_at = datetime('now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to stamp contact sync time")?;
        Ok(())
    }

    /// Delete a contact; its deals keep existing without a contact.
    pub fn delete_contact(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM contacts WHERE id = ?1", params![id])
            .context("Failed to delete contact")?;
        Ok(count > 0)
    }

    // ── Loss reasons ──────────────────────────────────────────────────

    pub fn list_loss_reasons(&self, include_inactive: bool) -> Result<Vec<LossReason>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, active, created_at FROM loss_reasons
                 WHERE ?1 OR active = 1 ORDER BY name COLLATE NOCASE",
            )
            .context("Failed to prepare list_loss_reasons")?;
        let rows = stmt
            .query_map(params![include_inactive], loss_reason_from_row)
            .context("Failed to query loss reasons")?;
        let mut reasons = Vec::new();
        for row in rows {
            reasons.push(row.context("Failed to read loss reason row")?);
        }
        Ok(reasons)
    }

    pub fn get_loss_reason(&self, id: i64) -> Result<Option<LossReason>> {
        self.conn
            .query_row(
                "SELECT id, name, active, created_at FROM loss_reasons WHERE id = ?1",
                params![id],
                loss_reason_from_row,
            )
            .optional()
            .context("Failed to query loss reason")
    }

    pub fn create_loss_reason(&self, name: &str) -> Result<LossReason> {
        let name = validate_name(name, "Loss reason")?;
        let exists: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM loss_reasons WHERE lower(name) = lower(?1)",
            params![name],
            |row| row.get(0),
        )?;
        if exists {
            return Err(CrmError::Conflict(format!("Loss reason '{}' already exists", name)).into());
        }
        self.conn
            .execute("INSERT INTO loss_reasons (name) VALUES (?1)", params![name])
            .context("Failed to insert loss reason")?;
        let id = self.conn.last_insert_rowid();
        self.get_loss_reason(id)?
            .context("Loss reason not found after insert")
    }

    pub fn update_loss_reason(
        &self,
        id: i64,
        name: Option<&str>,
        active: Option<bool>,
    ) -> Result<LossReason> {
        let current = self
            .get_loss_reason(id)?
            .ok_or(CrmError::LossReasonNotFound { id })?;
        let name = match name {
            Some(n) => validate_name(n, "Loss reason")?,
            None => current.name,
        };
        let active = active.unwrap_or(current.active);
        self.conn
            .execute(
                "UPDATE loss_reasons SET name = ?1, active = ?2 WHERE id = ?3",
                params![name, active, id],
            )
            .context("Failed to update loss reason")?;
        self.get_loss_reason(id)?
            .context("Loss reason not found after update")
    }

    pub fn delete_loss_reason(&self, id: i64) -> Result<Option<LossReasonRemoval>> {
        if self.get_loss_reason(id)?.is_none() {
            return Ok(None);
        }
        let referenced: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM deals WHERE loss_reason_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if referenced {
            self.conn
                .execute("UPDATE loss_reasons SET active = 0 WHERE id = ?1", params![id])
                .context("Failed to deactivate loss reason")?;
            return Ok(Some(LossReasonRemoval::Deactivated));
        }
        self.conn
            .execute("DELETE FROM loss_reasons WHERE id = ?1", params![id])
            .context("Failed to delete loss reason")?;
        Ok(Some(LossReasonRemoval::Deleted))
    }

    // ── Deals ─────────────────────────────────────────────────────────

    pub fn list_deals(&self) -> Result<Vec<Deal>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {DEAL_COLUMNS} FROM deals ORDER BY stage_id, position, id"
            ))
            .context("Failed to prepare list_deals")?;
        let rows = stmt
            .query_map([], DealRow::from_row)
            .context("Failed to query deals")?;
        let mut deals = Vec::new();
        for row in rows {
            deals.push(row.context("Failed to read deal row")?.into_deal()?);
        }
        Ok(deals)
    }

    /// Every deal joined with its contact.
    pub fn list_deal_cards(&self) -> Result<Vec<DealCard>> {
        let contacts: HashMap<i64, Contact> = self
            .list_contacts(None)?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();
        Ok(self
            .list_deals()?
            .into_iter()
            .map(|deal| {
                let contact = deal.contact_id.and_then(|id| contacts.get(&id).cloned());
                DealCard { deal, contact }
            })
            .collect())
    }

    pub fn get_deal(&self, id: i64) -> Result<Option<Deal>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {DEAL_COLUMNS} FROM deals WHERE id = ?1"),
                params![id],
                DealRow::from_row,
            )
            .optional()
            .context("Failed to query deal")?;
        row.map(DealRow::into_deal).transpose()
    }

    fn require_deal(&self, id: i64) -> Result<Deal> {
        self.get_deal(id)?
            .ok_or_else(|| CrmError::DealNotFound { id }.into())
    }

    pub fn get_deal_detail(&self, id: i64) -> Result<Option<DealDetail>> {
        let deal = match self.get_deal(id)? {
            Some(d) => d,
            None => return Ok(None),
        };
        let contact = match deal.contact_id {
            Some(cid) => self.get_contact(cid)?,
            None => None,
        };
        let stage = self.require_stage(deal.stage_id)?;
        let loss_reason = match deal.loss_reason_id {
            Some(rid) => self.get_loss_reason(rid)?,
            None => None,
        };
        let activities = self.list_activities(id)?;
        Ok(Some(DealDetail {
            card: DealCard { deal, contact },
            stage,
            loss_reason,
            activities,
        }))
    }

    pub fn create_deal(&self, new: &NewDeal) -> Result<Deal> {
        let title = validate_name(&new.title, "Deal title")?;
        validate_value(new.value_cents)?;
        let stage = self.require_stage(new.stage_id)?;
        if let Some(cid) = new.contact_id {
            if self.get_contact(cid)?.is_none() {
                return Err(CrmError::ContactNotFound { id: cid }.into());
            }
        }
        let close_date = validate_close_date(new.expected_close_date.as_deref())?;
        let currency = normalize_currency(new.currency.as_deref())?;
        let tags = serde_json::to_string(&normalize_tags(&new.tags))?;
        let status = stage.kind.deal_status();
        let priority = new.priority.unwrap_or(Priority::Medium);

        self.transaction(|db| {
            let position = db.deal_ids_in_stage(stage.id)?.len() as i32;
            db.conn
                .execute(
                    "INSERT INTO deals (title, value_cents, currency, stage_id, contact_id, owner, priority, status,
                                        expected_close_date, position, tags, notes, closed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                             CASE WHEN ?8 = 'open' THEN NULL ELSE datetime('now') END)",
                    params![
                        title,
                        new.value_cents,
                        currency,
                        stage.id,
                        new.contact_id,
                        blank_to_none(new.owner.as_deref()),
                        priority.as_str(),
                        status.as_str(),
                        close_date,
                        position,
                        tags,
                        new.notes.as_deref().unwrap_or("")
                    ],
                )
                .context("Failed to insert deal")?;
            let id = db.conn.last_insert_rowid();
            db.get_deal(id)?.context("Deal not found after insert")
        })
    }

    /// Apply a partial update. Stage and status changes go through
    /// [`CrmDb::move_deal`] and the won/lost operations instead.
    pub fn update_deal(&self, id: i64, patch: &DealPatch) -> Result<Deal> {
        let mut deal = self.require_deal(id)?;
        if let Some(title) = &patch.title {
            deal.title = validate_name(title, "Deal title")?;
        }
        if let Some(value) = patch.value_cents {
            validate_value(value)?;
            deal.value_cents = value;
        }
        if let Some(currency) = &patch.currency {
            deal.currency = normalize_currency(Some(currency))?;
        }
        if let Some(contact_id) = patch.contact_id {
            if let Some(cid) = contact_id {
                if self.get_contact(cid)?.is_none() {
                    return Err(CrmError::ContactNotFound { id: cid }.into());
                }
            }
            deal.contact_id = contact_id;
        }
        if let Some(owner) = &patch.owner {
            deal.owner = blank_to_none(owner.as_deref()).map(str::to_string);
        }
        if let Some(priority) = patch.priority {
            deal.priority = priority;
        }
        if let Some(date) = &patch.expected_close_date {
            deal.expected_close_date = validate_close_date(date.as_deref())?;
        }
        if let Some(tags) = &patch.tags {
            deal.tags = normalize_tags(tags);
        }
        if let Some(notes) = &patch.notes {
            deal.notes = notes.clone();
        }

        self.conn
            .execute(
                "UPDATE deals
                 SET title = ?1, value_cents = ?2, currency = ?3, contact_id = ?4, owner = ?5,
                     priority = ?6, expected_close_date = ?7, tags = ?8, notes = ?9,
                     updated_at = datetime('now')
                 WHERE id = ?10",
                params![
                    deal.title,
                    deal.value_cents,
                    deal.currency,
                    deal.contact_id,
                    deal.owner,
                    deal.priority.as_str(),
                    deal.expected_close_date,
                    serde_json::to_string(&deal.tags)?,
                    deal.notes,
                    id
                ],
            )
            .context("Failed to update deal")?;
        self.require_deal(id)
    }

    /// Move a deal to `position` within `stage_id` (clamped to the column
    /// bounds), renumbering the affected columns. Landing in a won/lost/open
    /// stage updates the deal status to match, and every stage or status
    /// change is logged as a lead activity.
    pub fn move_deal(&self, id: i64, stage_id: i64, position: i32) -> Result<DealMove> {
        self.transaction(|db| {
            let deal = db.require_deal(id)?;
            let target = db.require_stage(stage_id)?;
            let from_stage_id = deal.stage_id;

            let mut column: Vec<i64> = db
                .deal_ids_in_stage(stage_id)?
                .into_iter()
                .filter(|&other| other != id)
                .collect();
            let index = (position.max(0) as usize).min(column.len());
            column.insert(index, id);

            db.conn
                .execute(
                    "UPDATE deals SET stage_id = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![stage_id, id],
                )
                .context("Failed to move deal")?;
            db.renumber(&column)?;
            if from_stage_id != stage_id {
                let old_column = db.deal_ids_in_stage(from_stage_id)?;
                db.renumber(&old_column)?;
                let from_name = db
                    .get_stage(from_stage_id)?
                    .map(|s| s.name)
                    .unwrap_or_else(|| format!("#{}", from_stage_id));
                db.add_activity(
                    id,
                    ActivityKind::StageChange,
                    &format!("Moved from {} to {}", from_name, target.name),
                )?;
            }

            let status = target.kind.deal_status();
            if status != deal.status {
                db.set_status(id, status)?;
            }

            Ok(DealMove {
                deal: db.require_deal(id)?,
                from_stage_id,
            })
        })
    }

    /// Close a deal as won, moving it into the first won stage if one exists.
    pub fn mark_won(&self, id: i64) -> Result<DealMove> {
        self.transaction(|db| {
            let deal = db.require_deal(id)?;
            match db.first_stage_of_kind(StageKind::Won)? {
                Some(stage) if stage.id != deal.stage_id => db.move_deal(id, stage.id, i32::MAX),
                _ => {
                    if deal.status != DealStatus::Won {
                        db.set_status(id, DealStatus::Won)?;
                    }
                    Ok(DealMove {
                        deal: db.require_deal(id)?,
                        from_stage_id: deal.stage_id,
                    })
                }
            }
        })
    }

    /// Close a deal as lost with an active loss reason, moving it into the
    /// first lost stage if one exists.
    pub fn mark_lost(&self, id: i64, loss_reason_id: i64, note: Option<&str>) -> Result<DealMove> {
        let reason = self
            .get_loss_reason(loss_reason_id)?
            .ok_or(CrmError::LossReasonNotFound { id: loss_reason_id })?;
        if !reason.active {
            return Err(
                CrmError::BadRequest(format!("Loss reason '{}' is inactive", reason.name)).into(),
            );
        }
        self.transaction(|db| {
            let deal = db.require_deal(id)?;
            db.conn
                .execute(
                    "UPDATE deals SET loss_reason_id = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![loss_reason_id, id],
                )
                .context("Failed to set loss reason")?;
            let moved = match db.first_stage_of_kind(StageKind::Lost)? {
                Some(stage) if stage.id != deal.stage_id => db.move_deal(id, stage.id, i32::MAX)?,
                _ => {
                    if deal.status != DealStatus::Lost {
                        db.set_status(id, DealStatus::Lost)?;
                    }
                    DealMove {
                        deal: db.require_deal(id)?,
                        from_stage_id: deal.stage_id,
                    }
                }
            };
            if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
                db.add_activity(id, ActivityKind::Note, note)?;
            }
            Ok(moved)
        })
    }

    /// Reopen a closed deal into `stage_id`, or the first open stage.
    pub fn reopen_deal(&self, id: i64, stage_id: Option<i64>) -> Result<DealMove> {
        self.transaction(|db| {
            let deal = db.require_deal(id)?;
            if deal.status == DealStatus::Open && stage_id.is_none() {
                return Err(CrmError::Conflict(format!("Deal {} is already open", id)).into());
            }
            let target = match stage_id {
                Some(sid) => db.require_stage(sid)?,
                None => db.first_stage_of_kind(StageKind::Open)?.ok_or_else(|| {
                    CrmError::Conflict("No open stage to reopen the deal into".into())
                })?,
            };
            if target.kind != StageKind::Open {
                return Err(CrmError::BadRequest(format!(
                    "Stage '{}' is not an open stage",
                    target.name
                ))
                .into());
            }
            db.move_deal(id, target.id, i32::MAX)
        })
    }

    pub fn delete_deal(&self, id: i64) -> Result<bool> {
        self.transaction(|db| {
            let Some(deal) = db.get_deal(id)? else {
                return Ok(false);
            };
            db.conn
                .execute("DELETE FROM deals WHERE id = ?1", params![id])
                .context("Failed to delete deal")?;
            let column = db.deal_ids_in_stage(deal.stage_id)?;
            db.renumber(&column)?;
            Ok(true)
        })
    }

    fn set_status(&self, id: i64, status: DealStatus) -> Result<()> {
        let previous = self.require_deal(id)?.status;
        self.conn
            .execute(
                "UPDATE deals
                 SET status = ?1,
                     closed_at = CASE WHEN ?1 = 'open' THEN NULL ELSE datetime('now') END,
                     loss_reason_id = CASE WHEN ?1 = 'lost' THEN loss_reason_id ELSE NULL END,
                     updated_at = datetime('now')
                 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update deal status")?;
        self.add_activity(
            id,
            ActivityKind::StatusChange,
            &format!("Status changed from {} to {}", previous.as_str(), status.as_str()),
        )?;
        Ok(())
    }

    fn deal_ids_in_stage(&self, stage_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM deals WHERE stage_id = ?1 ORDER BY position, id")
            .context("Failed to prepare deal_ids_in_stage")?;
        let rows = stmt
            .query_map(params![stage_id], |row| row.get::<_, i64>(0))
            .context("Failed to query stage deals")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    fn renumber(&self, ordered_ids: &[i64]) -> Result<()> {
        for (position, deal_id) in ordered_ids.iter().enumerate() {
            self.conn
                .execute(
                    "UPDATE deals SET position = ?1 WHERE id = ?2",
                    params![position as i32, deal_id],
                )
                .context("Failed to renumber deal positions")?;
        }
        Ok(())
    }

    // ── Lead activities ───────────────────────────────────────────────

    pub fn add_activity(&self, deal_id: i64, kind: ActivityKind, content: &str) -> Result<LeadActivity> {
        self.conn
            .execute(
                "INSERT INTO lead_activities (deal_id, kind, content) VALUES (?1, ?2, ?3)",
                params![deal_id, kind.as_str(), content],
            )
            .context("Failed to insert lead activity")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, deal_id, kind, content, created_at FROM lead_activities WHERE id = ?1",
                params![id],
                ActivityRow::from_row,
            )
            .context("Lead activity not found after insert")?
            .into_activity()
    }

    /// Activities for a deal, newest first.
    pub fn list_activities(&self, deal_id: i64) -> Result<Vec<LeadActivity>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, deal_id, kind, content, created_at FROM lead_activities
                 WHERE deal_id = ?1 ORDER BY id DESC",
            )
            .context("Failed to prepare list_activities")?;
        let rows = stmt
            .query_map(params![deal_id], ActivityRow::from_row)
            .context("Failed to query lead activities")?;
        let mut activities = Vec::new();
        for row in rows {
            activities.push(row.context("Failed to read activity row")?.into_activity()?);
        }
        Ok(activities)
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("Failed to query setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                params![key, value],
            )
            .context("Failed to upsert setting")?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .context("Failed to delete setting")?;
        Ok(())
    }
}

// ── Validation helpers ────────────────────────────────────────────────

fn validate_name(value: &str, what: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CrmError::BadRequest(format!("{} must not be empty", what)).into());
    }
    Ok(trimmed.to_string())
}

fn validate_value(value_cents: i64) -> Result<()> {
    if value_cents < 0 {
        return Err(CrmError::BadRequest("Deal value must not be negative".into()).into());
    }
    if value_cents > MAX_VALUE_CENTS {
        return Err(CrmError::BadRequest(format!(
            "Deal value must not exceed {} cents",
            MAX_VALUE_CENTS
        ))
        .into());
    }
    Ok(())
}

fn validate_close_date(date: Option<&str>) -> Result<Option<String>> {
    match blank_to_none(date) {
        None => Ok(None),
        Some(d) => chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d")
            .map(|parsed| Some(parsed.format("%Y-%m-%d").to_string()))
            .map_err(|_| {
                CrmError::BadRequest(format!("Invalid expected close date '{}' (want YYYY-MM-DD)", d))
                    .into()
            }),
    }
}

fn normalize_currency(currency: Option<&str>) -> Result<String> {
    match blank_to_none(currency) {
        None => Ok("BRL".to_string()),
        Some(c) if c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic()) => {
            Ok(c.to_ascii_uppercase())
        }
        Some(c) => Err(CrmError::BadRequest(format!("Invalid currency code '{}'", c)).into()),
    }
}

/// Trim tags, drop blanks and duplicates, keep first-seen order.
fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !out.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            out.push(tag.to_string());
        }
    }
    out
}

fn blank_to_none(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// ── Row types ─────────────────────────────────────────────────────────

struct StageRow {
    id: i64,
    name: String,
    position: i32,
    color: Option<String>,
    kind: String,
    created_at: String,
}

impl StageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            position: row.get(2)?,
            color: row.get(3)?,
            kind: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_stage(self) -> Result<PipelineStage> {
        let kind = StageKind::from_str(&self.kind)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse stage kind")?;
        Ok(PipelineStage {
            id: self.id,
            name: self.name,
            position: self.position,
            color: self.color,
            kind,
            created_at: self.created_at,
        })
    }
}

struct ContactRow {
    id: i64,
    name: String,
    email: Option<String>,
    phone: Option<String>,
    company: Option<String>,
    chatwoot_id: Option<i64>,
    source: String,
    created_at: String,
    updated_at: String,
    last_synced_at: Option<String>,
}

impl ContactRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            phone: row.get(3)?,
            company: row.get(4)?,
            chatwoot_id: row.get(5)?,
            source: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            last_synced_at: row.get(9)?,
        })
    }

    fn into_contact(self) -> Result<Contact> {
        let source = ContactSource::from_str(&self.source)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse contact source")?;
        Ok(Contact {
            id: self.id,
            name: self.name,
            email: self.email,
            phone: self.phone,
            company: self.company,
            chatwoot_id: self.chatwoot_id,
            source,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_synced_at: self.last_synced_at,
        })
    }
}

/// Intermediate row struct for deals; enums and tags are stored as text.
struct DealRow {
    id: i64,
    title: String,
    value_cents: i64,
    currency: String,
    stage_id: i64,
    contact_id: Option<i64>,
    owner: Option<String>,
    priority: String,
    status: String,
    loss_reason_id: Option<i64>,
    expected_close_date: Option<String>,
    position: i32,
    tags: String,
    notes: String,
    created_at: String,
    updated_at: String,
    closed_at: Option<String>,
}

impl DealRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            value_cents: row.get(2)?,
            currency: row.get(3)?,
            stage_id: row.get(4)?,
            contact_id: row.get(5)?,
            owner: row.get(6)?,
            priority: row.get(7)?,
            status: row.get(8)?,
            loss_reason_id: row.get(9)?,
            expected_close_date: row.get(10)?,
            position: row.get(11)?,
            tags: row.get(12)?,
            notes: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            closed_at: row.get(16)?,
        })
    }

    fn into_deal(self) -> Result<Deal> {
        let priority = Priority::from_str(&self.priority)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse deal priority")?;
        let status = DealStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse deal status")?;
        let tags: Vec<String> =
            serde_json::from_str(&self.tags).context("Failed to parse deal tags JSON")?;
        Ok(Deal {
            id: self.id,
            title: self.title,
            value_cents: self.value_cents,
            currency: self.currency,
            stage_id: self.stage_id,
            contact_id: self.contact_id,
            owner: self.owner,
            priority,
            status,
            loss_reason_id: self.loss_reason_id,
            expected_close_date: self.expected_close_date,
            position: self.position,
            tags,
            notes: self.notes,
            created_at: self.created_at,
            updated_at: self.updated_at,
            closed_at: self.closed_at,
        })
    }
}

struct ActivityRow {
    id: i64,
    deal_id: i64,
    kind: String,
    content: String,
    created_at: String,
}

impl ActivityRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            deal_id: row.get(1)?,
            kind: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_activity(self) -> Result<LeadActivity> {
        let kind = ActivityKind::from_str(&self.kind)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse activity kind")?;
        Ok(LeadActivity {
            id: self.id,
            deal_id: self.deal_id,
            kind,
            content: self.content,
            created_at: self.created_at,
        })
    }
}

fn loss_reason_from_row(row: &Row<'_>) -> rusqlite::Result<LossReason> {
    Ok(LossReason {
        id: row.get(0)?,
        name: row.get(1)?,
        active: row.get(2)?,
        created_at: row.get(3)?,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Result<CrmDb> {
        let db = CrmDb::new_in_memory()?;
        db.seed_defaults()?;
        Ok(db)
    }

    fn new_deal(title: &str, stage_id: i64) -> NewDeal {
        NewDeal {
            title: title.to_string(),
            stage_id,
            ..NewDeal::default()
        }
    }

    fn stage_named(db: &CrmDb, name: &str) -> PipelineStage {
        db.list_stages()
            .unwrap()
            .into_iter()
            .find(|s| s.name == name)
            .expect("seeded stage should exist")
    }

    fn crm_error(err: &anyhow::Error) -> &CrmError {
        err.downcast_ref::<CrmError>().expect("expected a CrmError")
    }

    #[test]
    fn test_create_schema_tables() -> Result<()> {
        let db = CrmDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('pipeline_stages', 'contacts', 'loss_reasons', 'deals', 'lead_activities', 'settings')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 6, "Expected 6 tables to exist");
        Ok(())
    }

    #[test]
    fn test_seed_defaults_is_idempotent() -> Result<()> {
        let db = CrmDb::new_in_memory()?;
        assert!(db.seed_defaults()?);
        assert!(!db.seed_defaults()?);

        let stages = db.list_stages()?;
        let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Lead", "Qualified", "Proposal", "Negotiation", "Won", "Lost"]
        );
        assert_eq!(stages[4].kind, StageKind::Won);
        assert_eq!(stages[5].kind, StageKind::Lost);
        assert_eq!(db.list_loss_reasons(false)?.len(), 5);
        Ok(())
    }

    #[test]
    fn test_create_stage_appends() -> Result<()> {
        let db = seeded()?;
        let stage = db.create_stage("Onboarding", None, StageKind::Open)?;
        assert_eq!(stage.position, 6);
        assert_eq!(db.list_stages()?.last().map(|s| s.id), Some(stage.id));
        Ok(())
    }

    #[test]
    fn test_reorder_stages() -> Result<()> {
        let db = seeded()?;
        let mut ids: Vec<i64> = db.list_stages()?.iter().map(|s| s.id).collect();
        ids.reverse();
        let reordered = db.reorder_stages(&ids)?;
        assert_eq!(reordered.first().map(|s| s.name.as_str()), Some("Lost"));
        assert_eq!(reordered.last().map(|s| s.name.as_str()), Some("Lead"));

        // Missing one id is rejected
        let err = db.reorder_stages(&ids[1..]).unwrap_err();
        assert!(matches!(crm_error(&err), CrmError::BadRequest(_)));
        Ok(())
    }

    #[test]
    fn test_delete_stage_with_deals_requires_target() -> Result<()> {
        let db = seeded()?;
        let lead = stage_named(&db, "Lead");
        let qualified = stage_named(&db, "Qualified");
        let deal = db.create_deal(&new_deal("Acme", lead.id))?;

        let err = db.delete_stage(lead.id, None).unwrap_err();
        assert!(matches!(crm_error(&err), CrmError::Conflict(_)));

        assert!(db.delete_stage(lead.id, Some(qualified.id))?);
        let moved = db.get_deal(deal.id)?.unwrap();
        assert_eq!(moved.stage_id, qualified.id);
        assert!(db.get_stage(lead.id)?.is_none());
        // Remaining stages are renumbered from zero
        assert_eq!(db.list_stages()?[0].position, 0);

        assert!(!db.delete_stage(lead.id, None)?);
        Ok(())
    }

    #[test]
    fn test_create_deal_defaults_and_positions() -> Result<()> {
        let db = seeded()?;
        let lead = stage_named(&db, "Lead");
        let first = db.create_deal(&new_deal("First", lead.id))?;
        let second = db.create_deal(&new_deal("Second", lead.id))?;

        assert_eq!(first.position, 0);
        assert_eq!(second.position, 1);
        assert_eq!(first.status, DealStatus::Open);
        assert_eq!(first.priority, Priority::Medium);
        assert_eq!(first.currency, "BRL");
        assert!(first.closed_at.is_none());
        Ok(())
    }

    #[test]
    fn test_create_deal_validation() -> Result<()> {
        let db = seeded()?;
        let lead = stage_named(&db, "Lead");

        let err = db.create_deal(&new_deal("   ", lead.id)).unwrap_err();
        assert!(matches!(crm_error(&err), CrmError::BadRequest(_)));

        let err = db.create_deal(&new_deal("X", 999)).unwrap_err();
        assert!(matches!(crm_error(&err), CrmError::StageNotFound { id: 999 }));

        let mut negative = new_deal("X", lead.id);
        negative.value_cents = -1;
        assert!(db.create_deal(&negative).is_err());

        let mut huge = new_deal("X", lead.id);
        huge.value_cents = i64::MAX;
        let err = db.create_deal(&huge).unwrap_err();
        assert!(matches!(crm_error(&err), CrmError::BadRequest(_)));

        let mut at_limit = new_deal("X", lead.id);
        at_limit.value_cents = MAX_VALUE_CENTS;
        assert_eq!(db.create_deal(&at_limit)?.value_cents, MAX_VALUE_CENTS);

        let mut bad_date = new_deal("X", lead.id);
        bad_date.expected_close_date = Some("31/12/2024".into());
        let err = db.create_deal(&bad_date).unwrap_err();
        assert!(err.to_string().contains("YYYY-MM-DD"));

        let mut no_contact = new_deal("X", lead.id);
        no_contact.contact_id = Some(77);
        let err = db.create_deal(&no_contact).unwrap_err();
        assert!(matches!(crm_error(&err), CrmError::ContactNotFound { id: 77 }));
        Ok(())
    }

    #[test]
    fn test_create_deal_in_won_stage_is_closed() -> Result<()> {
        let db = seeded()?;
        let won = stage_named(&db, "Won");
        let deal = db.create_deal(&new_deal("Closed already", won.id))?;
        assert_eq!(deal.status, DealStatus::Won);
        assert!(deal.closed_at.is_some());
        Ok(())
    }

    #[test]
    fn test_update_deal_partial_fields() -> Result<()> {
        let db = seeded()?;
        let lead = stage_named(&db, "Lead");
        let contact = db.create_contact(
            &ContactFields {
                name: "Ana".into(),
                ..ContactFields::default()
            },
            ContactSource::Manual,
            None,
        )?;
        let mut new = new_deal("Old", lead.id);
        new.owner = Some("maria".into());
        new.tags = vec!["vip".into()];
        let deal = db.create_deal(&new)?;

        let updated = db.update_deal(
            deal.id,
            &DealPatch {
                title: Some("New".into()),
                value_cents: Some(99_00),
                contact_id: Some(Some(contact.id)),
                tags: Some(vec![" hot ".into(), "HOT".into(), "".into(), "q3".into()]),
                ..DealPatch::default()
            },
        )?;
        assert_eq!(updated.title, "New");
        assert_eq!(updated.value_cents, 9900);
        assert_eq!(updated.contact_id, Some(contact.id));
        assert_eq!(updated.owner.as_deref(), Some("maria"));
        assert_eq!(updated.tags, vec!["hot".to_string(), "q3".to_string()]);

        // Explicit null clears optional fields
        let cleared = db.update_deal(
            deal.id,
            &DealPatch {
                contact_id: Some(None),
                owner: Some(None),
                ..DealPatch::default()
            },
        )?;
        assert!(cleared.contact_id.is_none());
        assert!(cleared.owner.is_none());
        assert_eq!(cleared.title, "New");
        Ok(())
    }

    #[test]
    fn test_move_deal_reorders_columns() -> Result<()> {
        let db = seeded()?;
        let lead = stage_named(&db, "Lead");
        let qualified = stage_named(&db, "Qualified");
        let a = db.create_deal(&new_deal("A", lead.id))?;
        let b = db.create_deal(&new_deal("B", lead.id))?;
        let c = db.create_deal(&new_deal("C", lead.id))?;
        let q = db.create_deal(&new_deal("Q", qualified.id))?;

        // Reorder within a column
        db.move_deal(c.id, lead.id, 0)?;
        let order: Vec<i64> = db.deal_ids_in_stage(lead.id)?;
        assert_eq!(order, vec![c.id, a.id, b.id]);

        // Move across columns; position past the end is clamped
        let moved = db.move_deal(a.id, qualified.id, 99)?;
        assert_eq!(moved.from_stage_id, lead.id);
        assert_eq!(moved.deal.stage_id, qualified.id);
        assert_eq!(moved.deal.position, 1);
        assert_eq!(db.deal_ids_in_stage(qualified.id)?, vec![q.id, a.id]);
        assert_eq!(db.get_deal(b.id)?.unwrap().position, 1);

        let activities = db.list_activities(a.id)?;
        assert_eq!(activities[0].kind, ActivityKind::StageChange);
        assert_eq!(activities[0].content, "Moved from Lead to Qualified");
        Ok(())
    }

    #[test]
    fn test_move_into_won_stage_sets_status() -> Result<()> {
        let db = seeded()?;
        let lead = stage_named(&db, "Lead");
        let won = stage_named(&db, "Won");
        let deal = db.create_deal(&new_deal("Big one", lead.id))?;

        let moved = db.move_deal(deal.id, won.id, 0)?;
        assert_eq!(moved.deal.status, DealStatus::Won);
        assert!(moved.deal.closed_at.is_some());

        let back = db.move_deal(deal.id, lead.id, 0)?;
        assert_eq!(back.deal.status, DealStatus::Open);
        assert!(back.deal.closed_at.is_none());

        let kinds: Vec<ActivityKind> = db.list_activities(deal.id)?.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ActivityKind::StatusChange,
                ActivityKind::StageChange,
                ActivityKind::StatusChange,
                ActivityKind::StageChange,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_mark_lost_requires_active_reason() -> Result<()> {
        let db = seeded()?;
        let lead = stage_named(&db, "Lead");
        let lost = stage_named(&db, "Lost");
        let deal = db.create_deal(&new_deal("Maybe", lead.id))?;

        let err = db.mark_lost(deal.id, 999, None).unwrap_err();
        assert!(matches!(crm_error(&err), CrmError::LossReasonNotFound { id: 999 }));

        let reason = db.create_loss_reason("Went silent")?;
        db.update_loss_reason(reason.id, None, Some(false))?;
        let err = db.mark_lost(deal.id, reason.id, None).unwrap_err();
        assert!(matches!(crm_error(&err), CrmError::BadRequest(_)));

        let price = db
            .list_loss_reasons(false)?
            .into_iter()
            .find(|r| r.name == "Price")
            .unwrap();
        let moved = db.mark_lost(deal.id, price.id, Some("Too expensive for Q2"))?;
        assert_eq!(moved.deal.status, DealStatus::Lost);
        assert_eq!(moved.deal.stage_id, lost.id);
        assert_eq!(moved.deal.loss_reason_id, Some(price.id));

        let activities = db.list_activities(deal.id)?;
        assert_eq!(activities[0].kind, ActivityKind::Note);
        assert_eq!(activities[0].content, "Too expensive for Q2");
        Ok(())
    }

    #[test]
    fn test_mark_won_without_won_stage_sets_status_in_place() -> Result<()> {
        let db = CrmDb::new_in_memory()?;
        let only = db.create_stage("Inbox", None, StageKind::Open)?;
        let deal = db.create_deal(&new_deal("Solo", only.id))?;
        let moved = db.mark_won(deal.id)?;
        assert_eq!(moved.deal.stage_id, only.id);
        assert_eq!(moved.deal.status, DealStatus::Won);
        Ok(())
    }

    #[test]
    fn test_reopen_clears_loss_reason() -> Result<()> {
        let db = seeded()?;
        let lead = stage_named(&db, "Lead");
        let lost = stage_named(&db, "Lost");
        let deal = db.create_deal(&new_deal("Again", lead.id))?;
        let reason = db.list_loss_reasons(false)?[0].clone();
        db.mark_lost(deal.id, reason.id, None)?;

        let err = db.reopen_deal(deal.id, Some(lost.id)).unwrap_err();
        assert!(matches!(crm_error(&err), CrmError::BadRequest(_)));

        let reopened = db.reopen_deal(deal.id, None)?;
        assert_eq!(reopened.deal.stage_id, lead.id);
        assert_eq!(reopened.deal.status, DealStatus::Open);
        assert!(reopened.deal.loss_reason_id.is_none());
        Ok(())
    }

    #[test]
    fn test_reopen_open_deal_without_stage_conflicts() -> Result<()> {
        let db = seeded()?;
        let negotiation = stage_named(&db, "Negotiation");
        let lead = stage_named(&db, "Lead");
        let deal = db.create_deal(&new_deal("In progress", negotiation.id))?;

        let err = db.reopen_deal(deal.id, None).unwrap_err();
        assert!(matches!(crm_error(&err), CrmError::Conflict(_)));
        assert_eq!(db.get_deal(deal.id)?.unwrap().stage_id, negotiation.id);

        // An explicit open stage is still a plain move
        let moved = db.reopen_deal(deal.id, Some(lead.id))?;
        assert_eq!(moved.deal.stage_id, lead.id);
        assert_eq!(moved.deal.status, DealStatus::Open);
        Ok(())
    }

    #[test]
    fn test_changing_stage_kind_updates_deal_status() -> Result<()> {
        let db = seeded()?;
        let lead = stage_named(&db, "Lead");
        let qualified = stage_named(&db, "Qualified");
        let first = db.create_deal(&new_deal("First", lead.id))?;
        let second = db.create_deal(&new_deal("Second", lead.id))?;
        let elsewhere = db.create_deal(&new_deal("Elsewhere", qualified.id))?;

        let stage = db.update_stage(lead.id, None, None, Some(StageKind::Won))?;
        assert_eq!(stage.kind, StageKind::Won);
        for id in [first.id, second.id] {
            let deal = db.get_deal(id)?.unwrap();
            assert_eq!(deal.status, DealStatus::Won);
            assert!(deal.closed_at.is_some());
            assert_eq!(db.list_activities(id)?[0].kind, ActivityKind::StatusChange);
        }
        assert_eq!(db.get_deal(elsewhere.id)?.unwrap().status, DealStatus::Open);

        db.update_stage(lead.id, None, None, Some(StageKind::Open))?;
        let reverted = db.get_deal(first.id)?.unwrap();
        assert_eq!(reverted.status, DealStatus::Open);
        assert!(reverted.closed_at.is_none());

        // Renaming alone leaves statuses and history untouched
        let before = db.list_activities(first.id)?.len();
        db.update_stage(lead.id, Some("Inbound"), None, None)?;
        assert_eq!(db.list_activities(first.id)?.len(), before);
        Ok(())
    }

    #[test]
    fn test_delete_loss_reason_deactivates_when_referenced() -> Result<()> {
        let db = seeded()?;
        let lead = stage_named(&db, "Lead");
        let used = db.create_loss_reason("Used")?;
        let unused = db.create_loss_reason("Unused")?;
        let deal = db.create_deal(&new_deal("D", lead.id))?;
        db.mark_lost(deal.id, used.id, None)?;

        assert_eq!(db.delete_loss_reason(used.id)?, Some(LossReasonRemoval::Deactivated));
        assert_eq!(db.delete_loss_reason(unused.id)?, Some(LossReasonRemoval::Deleted));
        assert_eq!(db.delete_loss_reason(unused.id)?, None);

        assert!(!db.get_loss_reason(used.id)?.unwrap().active);
        assert!(db.list_loss_reasons(false)?.iter().all(|r| r.id != used.id));
        assert!(db.list_loss_reasons(true)?.iter().any(|r| r.id == used.id));
        Ok(())
    }

    #[test]
    fn test_duplicate_loss_reason_conflicts() -> Result<()> {
        let db = seeded()?;
        let err = db.create_loss_reason("price").unwrap_err();
        assert!(matches!(crm_error(&err), CrmError::Conflict(_)));
        Ok(())
    }

    #[test]
    fn test_contact_search_and_delete_unlinks_deals() -> Result<()> {
        let db = seeded()?;
        let lead = stage_named(&db, "Lead");
        let ana = db.create_contact(
            &ContactFields {
                name: "Ana Souza".into(),
                email: Some("ana@acme.com".into()),
                company: Some("Acme".into()),
                ..ContactFields::default()
            },
            ContactSource::Manual,
            None,
        )?;
        db.create_contact(
            &ContactFields {
                name: "Bruno".into(),
                phone: Some("  ".into()),
                ..ContactFields::default()
            },
            ContactSource::Manual,
            None,
        )?;

        assert_eq!(db.list_contacts(None)?.len(), 2);
        let found = db.list_contacts(Some("ACME"))?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ana.id);
        // Blank strings are stored as NULL
        let bruno = db.list_contacts(Some("bruno"))?;
        assert!(bruno[0].phone.is_none());

        let mut new = new_deal("For Ana", lead.id);
        new.contact_id = Some(ana.id);
        let deal = db.create_deal(&new)?;
        assert!(db.delete_contact(ana.id)?);
        assert!(db.get_deal(deal.id)?.unwrap().contact_id.is_none());
        Ok(())
    }

    #[test]
    fn test_update_contact_keeps_chatwoot_id_unless_given() -> Result<()> {
        let db = seeded()?;
        let c = db.create_contact(
            &ContactFields {
                name: "Carla".into(),
                ..ContactFields::default()
            },
            ContactSource::Chatwoot,
            Some(12),
        )?;
        let updated = db.update_contact(
            c.id,
            &ContactFields {
                name: "Carla M.".into(),
                email: Some("carla@x.io".into()),
                ..ContactFields::default()
            },
            None,
        )?;
        assert_eq!(updated.chatwoot_id, Some(12));
        assert_eq!(updated.email.as_deref(), Some("carla@x.io"));

        let err = db
            .update_contact(999, &ContactFields { name: "x".into(), ..ContactFields::default() }, None)
            .unwrap_err();
        assert!(matches!(crm_error(&err), CrmError::ContactNotFound { id: 999 }));
        Ok(())
    }

    #[test]
    fn test_deal_detail_and_cascade() -> Result<()> {
        let db = seeded()?;
        let lead = stage_named(&db, "Lead");
        let deal = db.create_deal(&new_deal("Detail", lead.id))?;
        db.add_activity(deal.id, ActivityKind::Call, "Intro call")?;
        db.add_activity(deal.id, ActivityKind::Email, "Sent proposal")?;

        let detail = db.get_deal_detail(deal.id)?.expect("detail should exist");
        assert_eq!(detail.stage.id, lead.id);
        assert_eq!(detail.activities.len(), 2);
        assert_eq!(detail.activities[0].content, "Sent proposal");

        assert!(db.delete_deal(deal.id)?);
        assert!(db.get_deal_detail(deal.id)?.is_none());
        assert!(db.list_activities(deal.id)?.is_empty());
        assert!(!db.delete_deal(deal.id)?);
        Ok(())
    }

    #[test]
    fn test_failed_transaction_rolls_back() -> Result<()> {
        let db = seeded()?;
        let result: Result<()> = db.transaction(|db| {
            db.create_stage("Temporary", None, StageKind::Open)?;
            anyhow::bail!("boom")
        });
        assert!(result.is_err());
        assert!(db.list_stages()?.iter().all(|s| s.name != "Temporary"));
        Ok(())
    }

    #[test]
    fn test_settings_roundtrip() -> Result<()> {
        let db = CrmDb::new_in_memory()?;
        assert!(db.get_setting("chatwoot.base_url")?.is_none());
        db.set_setting("chatwoot.base_url", "https://a.example")?;
        db.set_setting("chatwoot.base_url", "https://b.example")?;
        assert_eq!(
            db.get_setting("chatwoot.base_url")?.as_deref(),
            Some("https://b.example")
        );
        db.delete_setting("chatwoot.base_url")?;
        assert!(db.get_setting("chatwoot.base_url")?.is_none());
        db.delete_setting("never.set")?;
        Ok(())
    }
}
