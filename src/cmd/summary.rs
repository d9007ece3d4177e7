//! Pipeline totals from the command line (`dealflow summary`).

use std::collections::HashMap;

use anyhow::Result;
use dealflow::config::CliOverrides;
use dealflow::crm::pipeline::{self, PipelineQuery, PipelineSummary};
use dealflow::crm::server::open_database;

use super::super::Cli;

/// Filter flags, in the same comma-separated form the HTTP API accepts.
#[derive(Debug, Default)]
pub struct SummaryFilters {
    pub search: Option<String>,
    pub statuses: Option<String>,
    pub stage_ids: Option<String>,
    pub owner: Option<String>,
    pub tags: Option<String>,
}

impl SummaryFilters {
    fn to_params(&self) -> HashMap<String, String> {
        [
            ("search", &self.search),
            ("statuses", &self.statuses),
            ("stage_ids", &self.stage_ids),
            ("owner", &self.owner),
            ("tags", &self.tags),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
        .collect()
    }
}

pub fn cmd_summary(cli: &Cli, filters: &SummaryFilters, json: bool) -> Result<()> {
    let query = PipelineQuery::from_params(&filters.to_params())?;
    let config = super::load_config(cli, CliOverrides::default())?;
    let db = open_database(&config.server.db_path)?;

    let stages = db.list_stages()?;
    let cards = db.list_deal_cards()?;
    let reasons = db.list_loss_reasons(true)?;
    let visible = pipeline::filter_deals(&cards, &query.filter);
    let summary = pipeline::summarize(&stages, &visible, &reasons);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let names: HashMap<i64, &str> = stages.iter().map(|s| (s.id, s.name.as_str())).collect();
    print_summary(&summary, &names);
    Ok(())
}

fn print_summary(summary: &PipelineSummary, stage_names: &HashMap<i64, &str>) {
    println!();
    println!("Pipeline Summary");
    println!("================");
    println!();
    println!("Total deals: {}", summary.total_deals);
    println!(
        "  Open: {:>4}  {:>14}",
        summary.open_deals,
        format_cents(summary.open_value_cents)
    );
    println!(
        "  Won:  {:>4}  {:>14}",
        summary.won_deals,
        format_cents(summary.won_value_cents)
    );
    println!(
        "  Lost: {:>4}  {:>14}",
        summary.lost_deals,
        format_cents(summary.lost_value_cents)
    );
    match summary.win_rate_percent {
        Some(rate) => println!("Win rate: {:.1}%", rate),
        None => println!("Win rate: n/a"),
    }
    if let Some(avg) = summary.average_deal_cents {
        println!("Average deal: {}", format_cents(avg));
    }
    println!();

    println!("By stage:");
    for bucket in &summary.by_stage {
        let name = stage_names.get(&bucket.stage_id).copied().unwrap_or("?");
        println!(
            "  {:<16} {:>4}  {:>14}",
            name,
            bucket.deal_count,
            format_cents(bucket.total_value_cents)
        );
    }

    if !summary.by_loss_reason.is_empty() {
        println!();
        println!("Loss reasons:");
        for reason in &summary.by_loss_reason {
            println!(
                "  {:<16} {:>4}  {:>14}",
                reason.name,
                reason.deal_count,
                format_cents(reason.total_value_cents)
            );
        }
    }
    println!();
}

/// `123456` → `1,234.56`
fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    let whole = (abs / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{}{}.{:02}", sign, grouped, abs % 100)
}
