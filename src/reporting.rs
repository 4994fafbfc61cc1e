// 📊 Reporting - tenant dashboards from range queries
//
// Every figure is one range_count or range_sum over a structure; nothing
// here scans records.

use crate::aggregate::KeyRange;
use crate::engine::Engine;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TenantSummary {
    pub tenant_id: String,

    pub active_clients: u64,
    pub lead_clients: u64,

    pub projects_in_progress: u64,
    pub projects_completed_this_month: u64,

    pub open_quotes: u64,
    pub open_quote_value_cents: i64,
    pub accepted_quote_value_cents: i64,

    pub outstanding_invoices: u64,
    pub outstanding_revenue_cents: i64,
    pub paid_invoices: u64,
    pub paid_revenue_cents: i64,
    pub paid_revenue_this_month_cents: i64,
}

/// [start of month, start of next month) in milliseconds
pub fn month_bounds(now: DateTime<Utc>) -> Result<(i64, i64)> {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .context("invalid month start")?;

    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let end = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .context("invalid month end")?;

    Ok((start.timestamp_millis(), end.timestamp_millis()))
}

pub fn tenant_summary(engine: &Engine, tenant_id: &str, now: DateTime<Utc>) -> Result<TenantSummary> {
    let (month_start, month_end) = month_bounds(now)?;
    let in_bucket = |bucket: &str| KeyRange::tenant(tenant_id).bucket(bucket);

    let sent_quotes = engine.range("quotes", &in_bucket("sent"))?;
    let sent_invoices = engine.range("invoice_revenue", &in_bucket("sent"))?;
    let overdue_invoices = engine.range("invoice_revenue", &in_bucket("overdue"))?;
    let paid_invoices = engine.range("invoice_revenue", &in_bucket("paid"))?;

    Ok(TenantSummary {
        tenant_id: tenant_id.to_string(),

        active_clients: engine.range_count("clients", &in_bucket("active"))?,
        lead_clients: engine.range_count("clients", &in_bucket("lead"))?,

        projects_in_progress: engine.range_count("projects", &in_bucket("in_progress"))?,
        projects_completed_this_month: engine.range_count(
            "projects",
            &in_bucket("completed").between(month_start, month_end),
        )?,

        open_quotes: sent_quotes.count,
        open_quote_value_cents: sent_quotes.sum,
        accepted_quote_value_cents: engine.range_sum("quotes", &in_bucket("accepted"))?,

        outstanding_invoices: sent_invoices.count + overdue_invoices.count,
        outstanding_revenue_cents: sent_invoices.sum + overdue_invoices.sum,
        paid_invoices: paid_invoices.count,
        paid_revenue_cents: paid_invoices.sum,
        paid_revenue_this_month_cents: engine.range_sum(
            "invoice_revenue",
            &in_bucket("paid").between(month_start, month_end),
        )?,
    })
}
