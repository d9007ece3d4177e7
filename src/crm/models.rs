use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What reaching a stage means for the deals in it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Open,
    Won,
    Lost,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Won => "won",
            Self::Lost => "lost",
        }
    }

    /// Deal status implied by landing in a stage of this kind.
    pub fn deal_status(&self) -> DealStatus {
        match self {
            Self::Open => DealStatus::Open,
            Self::Won => DealStatus::Won,
            Self::Lost => DealStatus::Lost,
        }
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "won" => Ok(Self::Won),
            "lost" => Ok(Self::Lost),
            _ => Err(format!("Invalid stage kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineStage {
    pub id: i64,
    pub name: String,
    pub position: i32,
    pub color: Option<String>,
    pub kind: StageKind,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Open,
    Won,
    Lost,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Won => "won",
            Self::Lost => "lost",
        }
    }
}

impl FromStr for DealStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "won" => Ok(Self::Won),
            "lost" => Ok(Self::Lost),
            _ => Err(format!("Invalid deal status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deal {
    pub id: i64,
    pub title: String,
    pub value_cents: i64,
    pub currency: String,
    pub stage_id: i64,
    pub contact_id: Option<i64>,
    pub owner: Option<String>,
    pub priority: Priority,
    pub status: DealStatus,
    pub loss_reason_id: Option<i64>,
    /// `YYYY-MM-DD`
    pub expected_close_date: Option<String>,
    pub position: i32,
    pub tags: Vec<String>,
    pub notes: String,
    pub created_at: String,
    pub updated_at: String,
    pub closed_at: Option<String>,
}

/// Where a contact record originated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContactSource {
    Manual,
    Chatwoot,
}

impl ContactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Chatwoot => "chatwoot",
        }
    }
}

impl FromStr for ContactSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "chatwoot" => Ok(Self::Chatwoot),
            _ => Err(format!("Invalid contact source: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub chatwoot_id: Option<i64>,
    pub source: ContactSource,
    pub created_at: String,
    pub updated_at: String,
    pub last_synced_at: Option<String>,
}

/// Field values for inserting or overwriting a contact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactFields {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LossReason {
    pub id: i64,
    pub name: String,
    pub active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Note,
    Call,
    Email,
    Meeting,
    StageChange,
    StatusChange,
    Sync,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Call => "call",
            Self::Email => "email",
            Self::Meeting => "meeting",
            Self::StageChange => "stage_change",
            Self::StatusChange => "status_change",
            Self::Sync => "sync",
        }
    }

    /// Kinds a user may record by hand; the rest are written by the system.
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Note | Self::Call | Self::Email | Self::Meeting)
    }
}

impl FromStr for ActivityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note" => Ok(Self::Note),
            "call" => Ok(Self::Call),
            "email" => Ok(Self::Email),
            "meeting" => Ok(Self::Meeting),
            "stage_change" => Ok(Self::StageChange),
            "status_change" => Ok(Self::StatusChange),
            "sync" => Ok(Self::Sync),
            _ => Err(format!("Invalid activity kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeadActivity {
    pub id: i64,
    pub deal_id: i64,
    pub kind: ActivityKind,
    pub content: String,
    pub created_at: String,
}

/// Fields accepted when creating a deal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDeal {
    pub title: String,
    #[serde(default)]
    pub value_cents: i64,
    pub currency: Option<String>,
    pub stage_id: i64,
    pub contact_id: Option<i64>,
    pub owner: Option<String>,
    pub priority: Option<Priority>,
    pub expected_close_date: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub notes: Option<String>,
}

/// Partial deal update. For nullable columns the outer `Option` says whether
/// the field was sent and the inner one carries an explicit `null`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DealPatch {
    pub title: Option<String>,
    pub value_cents: Option<i64>,
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub contact_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub owner: Option<Option<String>>,
    pub priority: Option<Priority>,
    #[serde(default, deserialize_with = "double_option")]
    pub expected_close_date: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub notes: Option<String>,
}

pub(crate) fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// API view types

/// A deal joined with its contact, the unit the board renders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DealCard {
    #[serde(flatten)]
    pub deal: Deal,
    pub contact: Option<Contact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealDetail {
    #[serde(flatten)]
    pub card: DealCard,
    pub stage: PipelineStage,
    pub loss_reason: Option<LossReason>,
    pub activities: Vec<LeadActivity>,
}
