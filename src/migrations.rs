// 🔧 Migrations - one-shot, re-runnable batch jobs
//
// Each job walks every tenant, collects per-record errors and keeps going.
// Completion markers are the data itself:
// - backfill_counters: a tenant with a counter is done
// - repair_invoice_totals: a stored total equal to the recomputed one
// - backfill_aggregates: an entity already present in a structure

use crate::db;
use crate::engine::Engine;
use crate::entities::{Client, EntityKind, Invoice, Project, Quote, TrackedEntity};
use crate::sequence::{self, DocumentKind};
use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationError {
    pub tenant_id: String,
    pub record_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<MigrationError>,
}

impl MigrationReport {
    fn error(&mut self, tenant_id: &str, record_id: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        warn!(tenant = tenant_id, record = record_id, error = %message, "migration record failed");
        self.errors.push(MigrationError {
            tenant_id: tenant_id.to_string(),
            record_id: record_id.map(str::to_string),
            message,
        });
    }

    fn merge(&mut self, other: MigrationReport) {
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }

    fn log(&self, job: &str) {
        info!(
            job,
            updated = self.updated,
            skipped = self.skipped,
            errors = self.errors.len(),
            "migration finished"
        );
    }
}

// ============================================================================
// COUNTERS
// ============================================================================

/// Initialize the counter of every tenant that has numbered records but no
/// counter yet, at the highest sequence found in its records.
pub fn backfill_counters(engine: &mut Engine, kind: DocumentKind) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();
    let tenants = db::tenants_with_records(engine.connection(), kind.entity_kind())?;

    for tenant in &tenants {
        if db::get_counter(engine.connection(), tenant, kind.as_str())?.is_some() {
            report.skipped += 1;
            continue;
        }

        let result = engine.in_transaction(|conn, _, _| {
            let (highest, unparseable) = sequence::scan_highest(conn, tenant, kind)?;
            db::init_counter(conn, tenant, kind.as_str(), highest)?;
            Ok(unparseable)
        });

        match result {
            Ok(unparseable) => {
                for (id, number) in unparseable {
                    report.error(tenant, Some(id.as_str()), format!("no sequence in number `{}`", number));
                }
                report.updated += 1;
            }
            Err(err) => report.error(tenant, None, format!("{:#}", err)),
        }
    }

    report.log("backfill_counters");
    Ok(report)
}

// ============================================================================
// INVOICE TOTALS
// ============================================================================

/// Recompute invoice totals from line items and patch the ones that drifted.
/// Patches go through Engine::update so the revenue structure follows.
pub fn repair_invoice_totals(engine: &mut Engine) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();
    let tenants = db::tenants_with_records(engine.connection(), EntityKind::Invoice)?;

    for tenant in &tenants {
        let rows = db::scan_tenant_raw(engine.connection(), EntityKind::Invoice, tenant)?;

        for (id, body) in rows {
            let mut invoice: Invoice = match serde_json::from_str(&body) {
                Ok(invoice) => invoice,
                Err(err) => {
                    report.error(tenant, Some(id.as_str()), format!("undecodable record: {}", err));
                    continue;
                }
            };

            if invoice.line_items.is_empty() {
                report.skipped += 1;
                continue;
            }

            let computed = match invoice.computed_total() {
                Ok(total) => total,
                Err(err) => {
                    report.error(tenant, Some(id.as_str()), err.to_string());
                    continue;
                }
            };
            if computed == invoice.total_cents {
                report.skipped += 1;
                continue;
            }

            let stored = invoice.total_cents;
            invoice.total_cents = computed;
            match engine.update(&invoice) {
                Ok(_) => {
                    info!(tenant = %tenant, invoice = %id, from = stored, to = computed, "invoice total repaired");
                    report.updated += 1;
                }
                Err(err) => report.error(tenant, Some(id.as_str()), format!("{:#}", err)),
            }
        }
    }

    report.log("repair_invoice_totals");
    Ok(report)
}

// ============================================================================
// AGGREGATES
// ============================================================================

/// Track live records that predate aggregate tracking.
pub fn backfill_aggregates(engine: &mut Engine) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();

    report.merge(backfill_kind::<Client>(engine)?);
    report.merge(backfill_kind::<Project>(engine)?);
    report.merge(backfill_kind::<Quote>(engine)?);
    report.merge(backfill_kind::<Invoice>(engine)?);

    report.log("backfill_aggregates");
    Ok(report)
}

fn backfill_kind<E: TrackedEntity>(engine: &mut Engine) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();
    let tenants = db::tenants_with_records(engine.connection(), E::KIND)?;

    for tenant in &tenants {
        let rows = db::scan_tenant_raw(engine.connection(), E::KIND, tenant)?;

        for (id, body) in rows {
            let entity: E = match serde_json::from_str(&body) {
                Ok(entity) => entity,
                Err(err) => {
                    report.error(tenant, Some(id.as_str()), format!("undecodable record: {}", err));
                    continue;
                }
            };

            match engine.in_transaction(|_, sync, log| sync.track_if_missing(&entity, log)) {
                Ok(0) => report.skipped += 1,
                Ok(_) => report.updated += 1,
                Err(err) => report.error(tenant, Some(id.as_str()), format!("{:#}", err)),
            }
        }
    }

    Ok(report)
}

/// Full per-tenant reconciliation: besides tracking missing records, re-key
/// drifted nodes and drop nodes whose records are gone. `updated` counts
/// tenants that needed any change.
pub fn reconcile_aggregates(engine: &mut Engine) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();

    report.merge(reconcile_kind::<Client>(engine)?);
    report.merge(reconcile_kind::<Project>(engine)?);
    report.merge(reconcile_kind::<Quote>(engine)?);
    report.merge(reconcile_kind::<Invoice>(engine)?);

    report.log("reconcile_aggregates");
    Ok(report)
}

fn reconcile_kind<E: TrackedEntity>(engine: &mut Engine) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();

    let mut tenants = db::tenants_with_records(engine.connection(), E::KIND)?;
    for metric in E::metrics() {
        if let Some(tree) = engine.sync().structures().get(metric.name) {
            tenants.extend(tree.tenants());
        }
    }
    tenants.sort();
    tenants.dedup();

    for tenant in &tenants {
        let live: Vec<E> = match db::scan_tenant(engine.connection(), tenant) {
            Ok(live) => live,
            Err(err) => {
                report.error(tenant, None, format!("{:#}", err));
                continue;
            }
        };

        let summary = match engine.in_transaction(|_, sync, log| sync.reconcile_tenant(tenant, &live, log)) {
            Ok(summary) => summary,
            Err(err) => {
                report.error(tenant, None, format!("{:#}", err));
                continue;
            }
        };

        for (id, reason) in &summary.rejected {
            report.error(tenant, Some(id.as_str()), reason.clone());
        }
        if summary.changed() > 0 {
            info!(
                tenant = %tenant,
                kind = %E::KIND,
                inserted = summary.inserted,
                repaired = summary.repaired,
                removed = summary.removed,
                "aggregates reconciled"
            );
            report.updated += 1;
        } else {
            report.skipped += 1;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::KeyRange;
    use crate::config::EngineConfig;
    use crate::entities::{ClientStatus, InvoiceStatus, LineItem};

    fn engine() -> Engine {
        Engine::open_in_memory(EngineConfig::default()).unwrap()
    }

    fn legacy_invoice(engine: &Engine, tenant: &str, number: &str, total: i64) -> Invoice {
        let mut invoice = Invoice::new(tenant).with_total(total).with_status(InvoiceStatus::Sent);
        invoice.number = Some(number.to_string());
        // Straight into the store: predates aggregate tracking
        db::insert_record(engine.connection(), &invoice).unwrap();
        invoice
    }

    #[test]
    fn test_counter_backfill_is_idempotent() {
        let mut engine = engine();
        legacy_invoice(&engine, "t1", "INV-0004", 100);
        legacy_invoice(&engine, "t1", "INV-0012", 100);
        legacy_invoice(&engine, "t1", "imported", 100);
        legacy_invoice(&engine, "t2", "INV-0001", 100);

        let first = backfill_counters(&mut engine, DocumentKind::Invoice).unwrap();
        assert_eq!(first.updated, 2);
        assert_eq!(first.errors.len(), 1);
        assert_eq!(first.errors[0].tenant_id, "t1");

        let second = backfill_counters(&mut engine, DocumentKind::Invoice).unwrap();
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped, 2);
        assert!(second.errors.is_empty());

        assert_eq!(db::get_counter(engine.connection(), "t1", "invoice").unwrap(), Some(12));
        assert_eq!(engine.next_sequence("t1", DocumentKind::Invoice).unwrap(), 13);
    }

    #[test]
    fn test_counter_backfill_skips_tenants_with_counters() {
        let mut engine = engine();
        legacy_invoice(&engine, "t1", "INV-0040", 100);
        db::init_counter(engine.connection(), "t1", "invoice", 3).unwrap();

        let report = backfill_counters(&mut engine, DocumentKind::Invoice).unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(db::get_counter(engine.connection(), "t1", "invoice").unwrap(), Some(3));
    }

    #[test]
    fn test_repair_invoice_totals() {
        let mut engine = engine();

        // 3 x 33.33 + 8.25% tax = 108.24; stored as the pre-tax subtotal
        let mut drifted = Invoice::new("t1")
            .with_line_item(LineItem::new("Consulting", 3, 3_333))
            .with_tax_rate(825)
            .with_status(InvoiceStatus::Paid);
        drifted.total_cents = 9_999;
        engine.create(&drifted).unwrap();

        let correct = Invoice::new("t1")
            .with_line_item(LineItem::new("Hosting", 1, 900))
            .with_status(InvoiceStatus::Paid);
        engine.create(&correct).unwrap();

        let no_items = Invoice::new("t1").with_total(500).with_status(InvoiceStatus::Paid);
        engine.create(&no_items).unwrap();

        let first = repair_invoice_totals(&mut engine).unwrap();
        assert_eq!(first.updated, 1);
        assert_eq!(first.skipped, 2);

        let stored: Invoice = db::get_record(engine.connection(), &drifted.id).unwrap().unwrap();
        assert_eq!(stored.total_cents, 10_824);
        assert_eq!(
            engine
                .range_sum("invoice_revenue", &KeyRange::tenant("t1").bucket("paid"))
                .unwrap(),
            10_824 + 900 + 500
        );

        let second = repair_invoice_totals(&mut engine).unwrap();
        assert_eq!(second.updated, 0);
    }

    #[test]
    fn test_repaired_totals_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            database_path: dir.path().join("records.db"),
            ..EngineConfig::default()
        };

        let mut drifted = Invoice::new("t1")
            .with_line_item(LineItem::new("Consulting", 2, 5_000))
            .with_status(InvoiceStatus::Paid);
        drifted.total_cents = 1;
        {
            let mut engine = Engine::open(config.clone()).unwrap();
            engine.create(&drifted).unwrap();
            assert_eq!(repair_invoice_totals(&mut engine).unwrap().updated, 1);
        }

        let engine = Engine::open(config).unwrap();
        let paid = KeyRange::tenant("t1").bucket("paid");
        assert_eq!(engine.range_sum("invoice_revenue", &paid).unwrap(), 10_000);
        assert_eq!(engine.range_count("invoice_revenue", &paid).unwrap(), 1);
    }

    #[test]
    fn test_overflowing_invoice_is_reported_not_fatal() {
        let mut engine = engine();

        let mut huge = Invoice::new("t1").with_status(InvoiceStatus::Sent);
        huge.line_items.push(LineItem::new("Licences", i64::MAX / 2, 3));
        db::insert_record(engine.connection(), &huge).unwrap();

        let mut drifted = Invoice::new("t1").with_line_item(LineItem::new("Hosting", 1, 900));
        drifted.total_cents = 0;
        engine.create(&drifted).unwrap();

        let report = repair_invoice_totals(&mut engine).unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].record_id.as_deref(), Some(huge.id.as_str()));
        assert!(report.errors[0].message.contains("overflows"));
    }

    #[test]
    fn test_aggregate_backfill_tracks_legacy_records() {
        let mut engine = engine();
        legacy_invoice(&engine, "t1", "INV-0001", 1_000);
        legacy_invoice(&engine, "t1", "INV-0002", 2_000);
        engine.create(&Invoice::new("t1").with_total(4_000).with_status(InvoiceStatus::Sent)).unwrap();
        db::insert_record(engine.connection(), &Client::new("t1", "Legacy")).unwrap();

        assert_eq!(engine.range_sum("invoice_revenue", &KeyRange::tenant("t1")).unwrap(), 4_000);

        let first = backfill_aggregates(&mut engine).unwrap();
        assert_eq!(first.updated, 3);
        assert_eq!(first.skipped, 1);

        assert_eq!(engine.range_sum("invoice_revenue", &KeyRange::tenant("t1")).unwrap(), 7_000);
        assert_eq!(engine.range_count("invoice_count", &KeyRange::tenant("t1")).unwrap(), 3);
        assert_eq!(engine.range_count("clients", &KeyRange::tenant("t1")).unwrap(), 1);

        let second = backfill_aggregates(&mut engine).unwrap();
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped, 4);
    }

    #[test]
    fn test_reconcile_drops_stale_nodes() {
        let mut engine = engine();
        let client = Client::new("t1", "Acme");
        engine.create(&client).unwrap();

        // Record removed and re-inserted behind the engine's back
        db::delete_record(engine.connection(), EntityKind::Client, &client.id).unwrap();
        let lead = Client::new("t1", "Initech").with_status(ClientStatus::Lead);
        db::insert_record(engine.connection(), &lead).unwrap();

        let first = reconcile_aggregates(&mut engine).unwrap();
        assert_eq!(first.updated, 1);
        assert_eq!(engine.range_count("clients", &KeyRange::tenant("t1")).unwrap(), 1);
        assert_eq!(
            engine.range_count("clients", &KeyRange::tenant("t1").bucket("lead")).unwrap(),
            1
        );

        let second = reconcile_aggregates(&mut engine).unwrap();
        assert_eq!(second.updated, 0);
    }
}
