// 📥 CSV Import - bulk load of business records
//
// Columns: kind,id,tenant_id,status,number,total_cents,created_at,closed_at
// plus an optional name (clients and projects). `closed_at` is the
// completion time of a project and the payment time of an invoice.
// Timestamps are RFC 3339 or plain YYYY-MM-DD dates.
//
// Rows either go through Engine::create (tracked) or straight into the
// store (untracked, the state of records that predate aggregate tracking).

use crate::db;
use crate::engine::Engine;
use crate::entities::{
    Client, ClientStatus, EntityKind, Invoice, InvoiceStatus, Project, ProjectStatus, Quote,
    QuoteStatus, TrackedEntity,
};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ImportRow {
    pub kind: String,
    pub id: String,
    pub tenant_id: String,
    pub status: String,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub total_cents: Option<i64>,
    pub created_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Through the engine: records and structures
    Tracked,
    /// Store only, as if written before aggregates existed
    Untracked,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    /// (CSV line, message)
    pub failed: Vec<(usize, String)>,
}

pub fn import_csv(engine: &mut Engine, path: &Path, mode: ImportMode) -> Result<ImportReport> {
    let rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;
    import_rows(engine, rdr, mode)
}

pub fn import_reader<R: Read>(engine: &mut Engine, reader: R, mode: ImportMode) -> Result<ImportReport> {
    import_rows(engine, csv::Reader::from_reader(reader), mode)
}

fn import_rows<R: Read>(engine: &mut Engine, mut rdr: csv::Reader<R>, mode: ImportMode) -> Result<ImportReport> {
    let mut report = ImportReport::default();

    for (index, result) in rdr.deserialize::<ImportRow>().enumerate() {
        // Header is line 1
        let line = index + 2;

        let outcome = result
            .context("Failed to deserialize row")
            .and_then(|row| import_row(engine, &row, mode));

        match outcome {
            Ok(()) => report.imported += 1,
            Err(err) => {
                tracing::warn!(line, error = %format!("{:#}", err), "import row rejected");
                report.failed.push((line, format!("{:#}", err)));
            }
        }
    }

    Ok(report)
}

fn import_row(engine: &mut Engine, row: &ImportRow, mode: ImportMode) -> Result<()> {
    let kind = EntityKind::parse(&row.kind).ok_or_else(|| anyhow!("unknown kind `{}`", row.kind))?;

    match kind {
        EntityKind::Client => store(engine, &client_from(row)?, mode),
        EntityKind::Project => store(engine, &project_from(row)?, mode),
        EntityKind::Quote => store(engine, &quote_from(row)?, mode),
        EntityKind::Invoice => store(engine, &invoice_from(row)?, mode),
    }
}

fn store<E: TrackedEntity>(engine: &mut Engine, entity: &E, mode: ImportMode) -> Result<()> {
    match mode {
        ImportMode::Tracked => engine.create(entity).map(|_| ()),
        ImportMode::Untracked => {
            entity.validate()?;
            db::insert_record(engine.connection(), entity)
        }
    }
}

fn client_from(row: &ImportRow) -> Result<Client> {
    let status = ClientStatus::parse(&row.status)
        .ok_or_else(|| anyhow!("unknown client status `{}`", row.status))?;

    Ok(Client {
        id: row.id.clone(),
        tenant_id: row.tenant_id.clone(),
        name: row.name.clone().unwrap_or_else(|| row.id.clone()),
        status,
        created_at: parse_timestamp(&row.created_at)?,
    })
}

fn project_from(row: &ImportRow) -> Result<Project> {
    let status = ProjectStatus::parse(&row.status)
        .ok_or_else(|| anyhow!("unknown project status `{}`", row.status))?;

    Ok(Project {
        id: row.id.clone(),
        tenant_id: row.tenant_id.clone(),
        client_id: None,
        name: row.name.clone().unwrap_or_else(|| row.id.clone()),
        status,
        created_at: parse_timestamp(&row.created_at)?,
        completed_at: parse_optional(row.closed_at.as_deref())?,
    })
}

fn quote_from(row: &ImportRow) -> Result<Quote> {
    let status = QuoteStatus::parse(&row.status)
        .ok_or_else(|| anyhow!("unknown quote status `{}`", row.status))?;

    Ok(Quote {
        id: row.id.clone(),
        tenant_id: row.tenant_id.clone(),
        client_id: None,
        number: non_empty(row.number.as_deref()),
        status,
        line_items: Vec::new(),
        total_cents: row.total_cents.unwrap_or(0),
        created_at: parse_timestamp(&row.created_at)?,
    })
}

fn invoice_from(row: &ImportRow) -> Result<Invoice> {
    let status = InvoiceStatus::parse(&row.status)
        .ok_or_else(|| anyhow!("unknown invoice status `{}`", row.status))?;

    Ok(Invoice {
        id: row.id.clone(),
        tenant_id: row.tenant_id.clone(),
        client_id: None,
        number: non_empty(row.number.as_deref()),
        status,
        line_items: Vec::new(),
        tax_rate_bps: 0,
        total_cents: row.total_cents.unwrap_or(0),
        issued_at: parse_timestamp(&row.created_at)?,
        paid_at: parse_optional(row.closed_at.as_deref())?,
    })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("unrecognized timestamp `{}`", value))?;
    match date.and_hms_opt(0, 0, 0) {
        Some(naive) => Ok(Utc.from_utc_datetime(&naive)),
        None => bail!("unrecognized timestamp `{}`", value),
    }
}

fn parse_optional(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => parse_timestamp(v).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::KeyRange;
    use crate::config::EngineConfig;

    const SAMPLE: &str = "\
kind,id,tenant_id,status,number,total_cents,created_at,closed_at,name
client,c1,t1,active,,,2024-01-02,,Acme
project,p1,t1,completed,,,2024-01-05,2024-02-01,Website
quote,q1,t1,sent,Q-0003,50000,2024-01-06T09:30:00Z,,
invoice,i1,t1,paid,INV-0007,25000,2024-01-10,2024-01-20,
invoice,i2,t1,sent,INV-0008,10000,2024-01-11,,
invoice,i3,t1,lost,INV-0009,10000,2024-01-11,,
payment,x1,t1,paid,,,2024-01-11,,
";

    fn engine() -> Engine {
        Engine::open_in_memory(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_tracked_import() {
        let mut engine = engine();
        let report = import_reader(&mut engine, SAMPLE.as_bytes(), ImportMode::Tracked).unwrap();

        assert_eq!(report.imported, 5);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].0, 7);

        assert_eq!(
            engine.range_sum("invoice_revenue", &KeyRange::tenant("t1").bucket("paid")).unwrap(),
            25_000
        );
        assert_eq!(engine.range_count("projects", &KeyRange::tenant("t1")).unwrap(), 1);

        let client: Client = db::get_record(engine.connection(), "c1").unwrap().unwrap();
        assert_eq!(client.name, "Acme");
    }

    #[test]
    fn test_untracked_import_leaves_structures_empty() {
        let mut engine = engine();
        let report = import_reader(&mut engine, SAMPLE.as_bytes(), ImportMode::Untracked).unwrap();

        assert_eq!(report.imported, 5);
        assert_eq!(engine.range_count("invoice_count", &KeyRange::tenant("t1")).unwrap(), 0);
        assert_eq!(db::count_records(engine.connection(), EntityKind::Invoice, "t1").unwrap(), 2);
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(
            parse_timestamp("2024-03-01").unwrap(),
            parse_timestamp("2024-03-01T00:00:00Z").unwrap()
        );
        assert!(parse_timestamp("March 1st").is_err());
    }
}
