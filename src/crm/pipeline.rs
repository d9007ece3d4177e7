//! Board filtering, sorting and aggregation.
//!
//! Everything here is pure: callers load stages, deal cards and loss
//! reasons from the store and hand them in. The board and list endpoints
//! and the `summary` command all go through [`build_board`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::models::{DealCard, DealStatus, LossReason, PipelineStage, Priority};
use crate::errors::CrmError;

/// Criteria a deal card must meet. Absent fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DealFilter {
    pub search: Option<String>,
    #[serde(default)]
    pub stage_ids: Vec<i64>,
    #[serde(default)]
    pub statuses: Vec<DealStatus>,
    #[serde(default)]
    pub priorities: Vec<Priority>,
    pub owner: Option<String>,
    pub contact_id: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub min_value_cents: Option<i64>,
    pub max_value_cents: Option<i64>,
    pub created_from: Option<NaiveDate>,
    pub created_to: Option<NaiveDate>,
    pub close_from: Option<NaiveDate>,
    pub close_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Position,
    CreatedAt,
    UpdatedAt,
    Value,
    Title,
    ExpectedCloseDate,
    ContactName,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "position" => Ok(Self::Position),
            "created_at" => Ok(Self::CreatedAt),
            "updated_at" => Ok(Self::UpdatedAt),
            "value" => Ok(Self::Value),
            "title" => Ok(Self::Title),
            "expected_close_date" => Ok(Self::ExpectedCloseDate),
            "contact_name" => Ok(Self::ContactName),
            _ => Err(format!("Invalid sort key: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err(format!("Invalid sort direction: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineQuery {
    #[serde(default)]
    pub filter: DealFilter,
    #[serde(default)]
    pub sort: SortKey,
    #[serde(default)]
    pub direction: SortDirection,
}

impl PipelineQuery {
    /// Build a query from URL parameters. List parameters are
    /// comma-separated; unknown enum values and malformed numbers or dates
    /// are rejected.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, CrmError> {
        let filter = DealFilter {
            search: text_param(params, "search"),
            stage_ids: list_param(params, "stage_ids")?,
            statuses: list_param(params, "statuses")?,
            priorities: list_param(params, "priorities")?,
            owner: text_param(params, "owner"),
            contact_id: parse_param(params, "contact_id")?,
            tags: list_param(params, "tags")?,
            min_value_cents: parse_param(params, "min_value_cents")?,
            max_value_cents: parse_param(params, "max_value_cents")?,
            created_from: date_param(params, "created_from")?,
            created_to: date_param(params, "created_to")?,
            close_from: date_param(params, "close_from")?,
            close_to: date_param(params, "close_to")?,
        };
        Ok(Self {
            filter,
            sort: parse_param(params, "sort")?.unwrap_or_default(),
            direction: parse_param(params, "dir")?.unwrap_or_default(),
        })
    }
}

fn text_param(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_param<T>(params: &HashMap<String, String>, key: &str) -> Result<Option<T>, CrmError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    text_param(params, key)
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| CrmError::BadRequest(format!("Invalid '{}' parameter: {}", key, e)))
        })
        .transpose()
}

fn list_param<T>(params: &HashMap<String, String>, key: &str) -> Result<Vec<T>, CrmError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = text_param(params, key) else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<T>()
                .map_err(|e| CrmError::BadRequest(format!("Invalid '{}' parameter: {}", key, e)))
        })
        .collect()
}

fn date_param(params: &HashMap<String, String>, key: &str) -> Result<Option<NaiveDate>, CrmError> {
    text_param(params, key)
        .map(|v| {
            NaiveDate::parse_from_str(&v, "%Y-%m-%d").map_err(|_| {
                CrmError::BadRequest(format!("Invalid '{}' parameter: expected YYYY-MM-DD", key))
            })
        })
        .transpose()
}

/// Leading `YYYY-MM-DD` of a stored timestamp or date.
fn date_part(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.get(..10)?, "%Y-%m-%d").ok()
}

fn within(date: NaiveDate, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    from.is_none_or(|f| date >= f) && to.is_none_or(|t| date <= t)
}

/// True when the card satisfies every criterion present in the filter.
pub fn matches(filter: &DealFilter, card: &DealCard) -> bool {
    let deal = &card.deal;

    if let Some(needle) = filter.search.as_deref().map(str::to_lowercase) {
        let contains = |s: &str| s.to_lowercase().contains(&needle);
        let contact_hit = card.contact.as_ref().is_some_and(|c| {
            contains(c.name.as_str())
                || c.email.as_deref().is_some_and(contains)
                || c.company.as_deref().is_some_and(contains)
                || c.phone.as_deref().is_some_and(contains)
        });
        let hit = contains(deal.title.as_str())
            || deal.owner.as_deref().is_some_and(contains)
            || deal.tags.iter().any(|t| contains(t.as_str()))
            || contact_hit;
        if !hit {
            return false;
        }
    }

    if !filter.stage_ids.is_empty() && !filter.stage_ids.contains(&deal.stage_id) {
        return false;
    }
    if !filter.statuses.is_empty() && !filter.statuses.contains(&deal.status) {
        return false;
    }
    if !filter.priorities.is_empty() && !filter.priorities.contains(&deal.priority) {
        return false;
    }
    if let Some(owner) = &filter.owner {
        if !deal.owner.as_deref().is_some_and(|o| o.eq_ignore_ascii_case(owner)) {
            return false;
        }
    }
    if let Some(contact_id) = filter.contact_id {
        if deal.contact_id != Some(contact_id) {
            return false;
        }
    }
    if !filter
        .tags
        .iter()
        .all(|wanted| deal.tags.iter().any(|t| t.eq_ignore_ascii_case(wanted)))
    {
        return false;
    }
    if filter.min_value_cents.is_some_and(|min| deal.value_cents < min) {
        return false;
    }
    if filter.max_value_cents.is_some_and(|max| deal.value_cents > max) {
        return false;
    }

    if filter.created_from.is_some() || filter.created_to.is_some() {
        match date_part(&deal.created_at) {
            Some(created) if within(created, filter.created_from, filter.created_to) => {}
            _ => return false,
        }
    }
    if filter.close_from.is_some() || filter.close_to.is_some() {
        match deal.expected_close_date.as_deref().and_then(date_part) {
            Some(close) if within(close, filter.close_from, filter.close_to) => {}
            _ => return false,
        }
    }

    true
}

/// Keep the cards matching `filter`, in their original order.
pub fn filter_deals(cards: &[DealCard], filter: &DealFilter) -> Vec<DealCard> {
    cards.iter().filter(|c| matches(filter, c)).cloned().collect()
}

/// Compare two optional keys. `None` sorts after every value in both
/// directions; only present values are flipped for `Desc`.
fn cmp_optional<T: Ord>(a: Option<T>, b: Option<T>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match direction {
            SortDirection::Asc => a.cmp(&b),
            SortDirection::Desc => b.cmp(&a),
        },
    }
}

/// Stable sort by `key`; ties fall back to ascending deal id.
pub fn sort_deals(cards: &mut [DealCard], key: SortKey, direction: SortDirection) {
    cards.sort_by(|a, b| {
        let (da, db) = (&a.deal, &b.deal);
        let primary = match key {
            SortKey::Position => cmp_optional(
                Some((da.stage_id, da.position)),
                Some((db.stage_id, db.position)),
                direction,
            ),
            SortKey::CreatedAt => {
                cmp_optional(Some(&da.created_at), Some(&db.created_at), direction)
            }
            SortKey::UpdatedAt => {
                cmp_optional(Some(&da.updated_at), Some(&db.updated_at), direction)
            }
            SortKey::Value => cmp_optional(Some(da.value_cents), Some(db.value_cents), direction),
            SortKey::Title => cmp_optional(
                Some(da.title.to_lowercase()),
                Some(db.title.to_lowercase()),
                direction,
            ),
            SortKey::ExpectedCloseDate => cmp_optional(
                da.expected_close_date.as_ref(),
                db.expected_close_date.as_ref(),
                direction,
            ),
            SortKey::ContactName => cmp_optional(
                a.contact.as_ref().map(|c| c.name.to_lowercase()),
                b.contact.as_ref().map(|c| c.name.to_lowercase()),
                direction,
            ),
        };
        primary.then_with(|| da.id.cmp(&db.id))
    });
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage_id: i64,
    pub deal_count: usize,
    pub total_value_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossReasonCount {
    pub loss_reason_id: i64,
    pub name: String,
    pub deal_count: usize,
    pub total_value_cents: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub total_deals: usize,
    pub open_deals: usize,
    pub won_deals: usize,
    pub lost_deals: usize,
    pub open_value_cents: i64,
    pub won_value_cents: i64,
    pub lost_value_cents: i64,
    /// `won / (won + lost)` as a percentage; `None` until a deal closes.
    pub win_rate_percent: Option<f64>,
    pub average_deal_cents: Option<i64>,
    pub by_stage: Vec<StageSummary>,
    pub by_loss_reason: Vec<LossReasonCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageColumn {
    pub stage: PipelineStage,
    pub deals: Vec<DealCard>,
    pub summary: StageSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardView {
    pub stages: Vec<StageColumn>,
    pub summary: PipelineSummary,
}

/// Aggregate totals for `cards`. Every stage gets a bucket, even when empty.
pub fn summarize(
    stages: &[PipelineStage],
    cards: &[DealCard],
    loss_reasons: &[LossReason],
) -> PipelineSummary {
    let mut summary = PipelineSummary {
        by_stage: stages
            .iter()
            .map(|s| StageSummary {
                stage_id: s.id,
                ..StageSummary::default()
            })
            .collect(),
        ..PipelineSummary::default()
    };
    let stage_index: HashMap<i64, usize> =
        stages.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
    let mut by_reason: HashMap<i64, LossReasonCount> = HashMap::new();
    let mut total_value: i64 = 0;

    for card in cards {
        let deal = &card.deal;
        summary.total_deals += 1;
        total_value = total_value.saturating_add(deal.value_cents);
        match deal.status {
            DealStatus::Open => {
                summary.open_deals += 1;
                summary.open_value_cents =
                    summary.open_value_cents.saturating_add(deal.value_cents);
            }
            DealStatus::Won => {
                summary.won_deals += 1;
                summary.won_value_cents =
                    summary.won_value_cents.saturating_add(deal.value_cents);
            }
            DealStatus::Lost => {
                summary.lost_deals += 1;
                summary.lost_value_cents =
                    summary.lost_value_cents.saturating_add(deal.value_cents);
                if let Some(reason_id) = deal.loss_reason_id {
                    let entry = by_reason.entry(reason_id).or_insert_with(|| LossReasonCount {
                        loss_reason_id: reason_id,
                        name: loss_reasons
                            .iter()
                            .find(|r| r.id == reason_id)
                            .map(|r| r.name.clone())
                            .unwrap_or_else(|| format!("Reason #{}", reason_id)),
                        deal_count: 0,
                        total_value_cents: 0,
                    });
                    entry.deal_count += 1;
                    entry.total_value_cents =
                        entry.total_value_cents.saturating_add(deal.value_cents);
                }
            }
        }
        if let Some(&idx) = stage_index.get(&deal.stage_id) {
            let bucket = &mut summary.by_stage[idx];
            bucket.deal_count += 1;
            bucket.total_value_cents = bucket.total_value_cents.saturating_add(deal.value_cents);
        }
    }

    let closed = summary.won_deals + summary.lost_deals;
    if closed > 0 {
        summary.win_rate_percent = Some(summary.won_deals as f64 * 100.0 / closed as f64);
    }
    if summary.total_deals > 0 {
        summary.average_deal_cents = Some(total_value / summary.total_deals as i64);
    }

    let mut reasons: Vec<LossReasonCount> = by_reason.into_values().collect();
    reasons.sort_by(|a, b| {
        b.deal_count
            .cmp(&a.deal_count)
            .then_with(|| a.name.cmp(&b.name))
    });
    summary.by_loss_reason = reasons;
    summary
}

/// Filter, sort and group cards into stage columns; the summary covers the
/// filtered set.
pub fn build_board(
    stages: &[PipelineStage],
    cards: &[DealCard],
    loss_reasons: &[LossReason],
    query: &PipelineQuery,
) -> BoardView {
    let mut visible = filter_deals(cards, &query.filter);
    sort_deals(&mut visible, query.sort, query.direction);
    let summary = summarize(stages, &visible, loss_reasons);

    let columns = stages
        .iter()
        .zip(summary.by_stage.iter())
        .map(|(stage, stage_summary)| StageColumn {
            stage: stage.clone(),
            deals: visible
                .iter()
                .filter(|c| c.deal.stage_id == stage.id)
                .cloned()
                .collect(),
            summary: stage_summary.clone(),
        })
        .collect();

    BoardView {
        stages: columns,
        summary,
    }
}
