// 🔢 Sequence Minting
//
// Per-tenant counters behind human-readable document numbers. A counter is
// created once (first use or backfill) at the highest sequence already
// embedded in the tenant's live records, then only ever advanced.

use crate::db;
use crate::entities::EntityKind;
use anyhow::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Invoice,
    Quote,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 2] = [DocumentKind::Invoice, DocumentKind::Quote];

    /// Counter name in the counters table
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "invoice",
            DocumentKind::Quote => "quote",
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            DocumentKind::Invoice => EntityKind::Invoice,
            DocumentKind::Quote => EntityKind::Quote,
        }
    }

    pub fn parse(value: &str) -> Option<DocumentKind> {
        match EntityKind::parse(value)? {
            EntityKind::Invoice => Some(DocumentKind::Invoice),
            EntityKind::Quote => Some(DocumentKind::Quote),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trailing run of ASCII digits: "INV-0042" -> 42
pub fn parse_sequence(number: &str) -> Option<i64> {
    let trimmed = number.trim();
    let digits_start = trimmed
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;

    trimmed[digits_start..].parse().ok()
}

/// Highest embedded sequence among a tenant's live records, with the
/// (record id, number) pairs that carry no parseable sequence.
pub fn scan_highest(
    conn: &Connection,
    tenant_id: &str,
    kind: DocumentKind,
) -> Result<(i64, Vec<(String, String)>)> {
    let mut highest = 0;
    let mut unparseable = Vec::new();

    for (id, number) in db::document_numbers(conn, kind.entity_kind(), tenant_id)? {
        match parse_sequence(&number) {
            Some(seq) => highest = highest.max(seq),
            None => unparseable.push((id, number)),
        }
    }

    Ok((highest, unparseable))
}

/// Advance the tenant's counter and return the new value, creating the
/// counter from a record scan on first use.
pub fn next_sequence(conn: &Connection, tenant_id: &str, kind: DocumentKind) -> Result<i64> {
    if db::get_counter(conn, tenant_id, kind.as_str())?.is_none() {
        let (highest, unparseable) = scan_highest(conn, tenant_id, kind)?;
        if !unparseable.is_empty() {
            debug!(
                tenant = tenant_id,
                kind = %kind,
                skipped = unparseable.len(),
                "ignoring document numbers without a sequence"
            );
        }

        db::init_counter(conn, tenant_id, kind.as_str(), highest)?;
        info!(tenant = tenant_id, kind = %kind, start = highest, "counter initialized on first use");
    }

    db::advance_counter(conn, tenant_id, kind.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Invoice, Quote};

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence("INV-0042"), Some(42));
        assert_eq!(parse_sequence("Q-7"), Some(7));
        assert_eq!(parse_sequence("2024/INV/118 "), Some(118));
        assert_eq!(parse_sequence("DRAFT"), None);
        assert_eq!(parse_sequence(""), None);
    }

    #[test]
    fn test_document_kind_parse() {
        assert_eq!(DocumentKind::parse("invoices"), Some(DocumentKind::Invoice));
        assert_eq!(DocumentKind::parse("quote"), Some(DocumentKind::Quote));
        assert_eq!(DocumentKind::parse("client"), None);
    }

    #[test]
    fn test_first_use_starts_above_existing_numbers() {
        let conn = open();

        for number in ["INV-0003", "INV-0017", "legacy"] {
            let mut invoice = Invoice::new("t1");
            invoice.number = Some(number.to_string());
            db::insert_record(&conn, &invoice).unwrap();
        }

        assert_eq!(next_sequence(&conn, "t1", DocumentKind::Invoice).unwrap(), 18);
        assert_eq!(next_sequence(&conn, "t1", DocumentKind::Invoice).unwrap(), 19);

        // Separate counters per kind and per tenant
        assert_eq!(next_sequence(&conn, "t1", DocumentKind::Quote).unwrap(), 1);
        assert_eq!(next_sequence(&conn, "t2", DocumentKind::Invoice).unwrap(), 1);
    }

    #[test]
    fn test_scan_reports_unparseable_numbers() {
        let conn = open();

        let mut quote = Quote::new("t1");
        quote.number = Some("Q-12".to_string());
        db::insert_record(&conn, &quote).unwrap();

        let mut bad = Quote::new("t1");
        bad.number = Some("pending".to_string());
        db::insert_record(&conn, &bad).unwrap();

        let (highest, unparseable) = scan_highest(&conn, "t1", DocumentKind::Quote).unwrap();
        assert_eq!(highest, 12);
        assert_eq!(unparseable, vec![(bad.id.clone(), "pending".to_string())]);
    }
}
