// 🔄 Aggregate Sync Layer - domain events -> structure operations
//
// on_create inserts, on_update replaces (only the structures whose
// projection changed), on_delete deletes. MissingKey is the one tolerated
// fault:
// - on replace it falls back to inserting the new node (the entity becomes
//   tracked from now on)
// - on delete it is swallowed (nothing to remove)
// Anything else fails the call after every structure has been attempted.
//
// Every successful structure operation goes into an UndoLog so the caller
// can restore the structures when the surrounding store transaction aborts.

use crate::aggregate::{AggregateKey, AggregateSet, AggregateTree, KeyRange, RangeStats};
use crate::classifier::is_missing_key_error;
use crate::entities::{metric_names, EntityKind, TrackedEntity};
use crate::error::EngineError;
use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

// ============================================================================
// OUTCOMES
// ============================================================================

/// Result of replace-with-fallback on one structure
#[derive(Debug)]
pub enum ReplaceOutcome {
    /// Old node found and swapped for the new one
    Replaced { previous_value: i64 },

    /// Old node was never tracked; the new node was inserted instead
    InsertedFresh,

    /// Genuine fault; the structure is unchanged
    Failed(anyhow::Error),
}

/// Result of delete-if-tracked on one structure
#[derive(Debug)]
pub enum DeleteOutcome {
    Deleted { value: i64 },

    /// Entity was never tracked; nothing to remove
    NotTracked,

    Failed(anyhow::Error),
}

/// Replace `old` with `new`, inserting `new` when `old` was never tracked.
pub fn replace_or_insert(
    tree: &mut AggregateTree,
    old: &AggregateKey,
    new: AggregateKey,
    value: i64,
) -> ReplaceOutcome {
    let err = match tree.replace(old, new.clone(), value) {
        Ok(previous_value) => return ReplaceOutcome::Replaced { previous_value },
        Err(e) => anyhow::Error::new(e),
    };

    if !is_missing_key_error(&err) {
        return ReplaceOutcome::Failed(err);
    }

    warn!(
        structure = tree.name(),
        key = %old,
        "replace found no existing node; inserting fresh"
    );

    match tree.insert(new, value) {
        Ok(()) => ReplaceOutcome::InsertedFresh,
        Err(e) => ReplaceOutcome::Failed(e.into()),
    }
}

/// Delete `key`, treating an untracked key as already gone.
pub fn delete_if_tracked(tree: &mut AggregateTree, key: &AggregateKey) -> DeleteOutcome {
    match tree.delete(key) {
        Ok(value) => DeleteOutcome::Deleted { value },
        Err(e) => {
            let err = anyhow::Error::new(e);
            if is_missing_key_error(&err) {
                debug!(structure = tree.name(), key = %key, "delete skipped; key not tracked");
                DeleteOutcome::NotTracked
            } else {
                DeleteOutcome::Failed(err)
            }
        }
    }
}

// ============================================================================
// SYNC REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Inserted,
    Replaced,
    InsertedFresh,
    Deleted,
    NotTracked,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStep {
    pub metric: &'static str,
    pub action: SyncAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub kind: EntityKind,
    pub entity_id: String,
    pub steps: Vec<SyncStep>,
}

impl SyncReport {
    fn new(kind: EntityKind, entity_id: &str) -> Self {
        SyncReport {
            kind,
            entity_id: entity_id.to_string(),
            steps: Vec::new(),
        }
    }

    fn push(&mut self, metric: &'static str, action: SyncAction) {
        self.steps.push(SyncStep { metric, action });
    }

    pub fn action(&self, metric: &str) -> Option<SyncAction> {
        self.steps
            .iter()
            .find(|step| step.metric == metric)
            .map(|step| step.action)
    }

    /// Number of structure mutations performed
    pub fn mutations(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| !matches!(step.action, SyncAction::Unchanged | SyncAction::NotTracked))
            .count()
    }

    /// True when some structure had to fall back to a fresh insert
    pub fn self_healed(&self) -> bool {
        self.steps
            .iter()
            .any(|step| step.action == SyncAction::InsertedFresh)
    }
}

// ============================================================================
// UNDO LOG
// ============================================================================

#[derive(Debug)]
enum UndoEntry {
    /// Undo an insert
    Remove { metric: &'static str, key: AggregateKey },

    /// Undo a delete
    Restore {
        metric: &'static str,
        key: AggregateKey,
        value: i64,
    },
}

#[derive(Debug, Default)]
pub struct UndoLog {
    entries: Vec<UndoEntry>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Structures with at least one journaled change
    pub fn touched(&self) -> BTreeSet<&'static str> {
        self.entries
            .iter()
            .map(|entry| match entry {
                UndoEntry::Remove { metric, .. } | UndoEntry::Restore { metric, .. } => *metric,
            })
            .collect()
    }

    fn inserted(&mut self, metric: &'static str, key: AggregateKey) {
        self.entries.push(UndoEntry::Remove { metric, key });
    }

    fn deleted(&mut self, metric: &'static str, key: AggregateKey, value: i64) {
        self.entries.push(UndoEntry::Restore { metric, key, value });
    }
}

// ============================================================================
// RECONCILE SUMMARY
// ============================================================================

/// Outcome of comparing a tenant's live records against its structures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Entities that were missing from at least one structure
    pub inserted: usize,

    /// Entities tracked under a stale key or value
    pub repaired: usize,

    /// Entities tracked but no longer live
    pub removed: usize,

    /// Entities already tracked correctly everywhere
    pub unchanged: usize,

    /// (entity id, reason) for snapshots that failed validation
    pub rejected: Vec<(String, String)>,
}

impl ReconcileSummary {
    pub fn changed(&self) -> usize {
        self.inserted + self.repaired + self.removed
    }
}

// ============================================================================
// AGGREGATE SYNC
// ============================================================================

#[derive(Debug, Default)]
pub struct AggregateSync {
    structures: AggregateSet,
}

impl AggregateSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_set(structures: AggregateSet) -> Self {
        AggregateSync { structures }
    }

    pub fn structures(&self) -> &AggregateSet {
        &self.structures
    }

    pub(crate) fn structures_mut(&mut self) -> &mut AggregateSet {
        &mut self.structures
    }

    pub fn on_create<E: TrackedEntity>(&mut self, entity: &E, log: &mut UndoLog) -> Result<SyncReport> {
        entity.validate()?;

        let mut report = SyncReport::new(E::KIND, entity.id());
        let mut failures = Vec::new();

        for metric in E::metrics() {
            let (key, value) = metric.node(entity);
            let tree = self.structures.tree_mut(metric.name);

            match tree.insert(key.clone(), value) {
                Ok(()) => {
                    debug!(structure = metric.name, key = %key, value, "inserted");
                    log.entries.push(UndoEntry::Remove { metric: metric.name, key });
                    report.push(metric.name, SyncAction::Inserted);
                }
                Err(e) => failures.push((metric.name, anyhow::Error::new(e))),
            }
        }

        finish(report, failures)
    }

    /// Apply a before/after pair. Structures whose projection is identical
    /// on both snapshots are not touched.
    pub fn on_update<E: TrackedEntity>(
        &mut self,
        old: &E,
        new: &E,
        log: &mut UndoLog,
    ) -> Result<SyncReport> {
        old.validate()?;
        new.validate()?;

        if old.id() != new.id() || old.tenant_id() != new.tenant_id() {
            return Err(EngineError::validation(
                "snapshot",
                format!(
                    "before/after snapshots disagree on identity ({}/{} vs {}/{})",
                    old.tenant_id(),
                    old.id(),
                    new.tenant_id(),
                    new.id()
                ),
            )
            .into());
        }

        let mut report = SyncReport::new(E::KIND, new.id());
        let mut failures = Vec::new();

        for metric in E::metrics() {
            let (old_key, old_value) = metric.node(old);
            let (new_key, new_value) = metric.node(new);

            if old_key == new_key && old_value == new_value {
                report.push(metric.name, SyncAction::Unchanged);
                continue;
            }

            let tree = self.structures.tree_mut(metric.name);
            match replace_or_insert(tree, &old_key, new_key.clone(), new_value) {
                ReplaceOutcome::Replaced { previous_value } => {
                    debug!(structure = metric.name, from = %old_key, to = %new_key, "replaced");
                    log.entries.push(UndoEntry::Restore {
                        metric: metric.name,
                        key: old_key,
                        value: previous_value,
                    });
                    log.entries.push(UndoEntry::Remove { metric: metric.name, key: new_key });
                    report.push(metric.name, SyncAction::Replaced);
                }
                ReplaceOutcome::InsertedFresh => {
                    log.entries.push(UndoEntry::Remove { metric: metric.name, key: new_key });
                    report.push(metric.name, SyncAction::InsertedFresh);
                }
                ReplaceOutcome::Failed(err) => failures.push((metric.name, err)),
            }
        }

        if report.mutations() == 0 && failures.is_empty() {
            debug!(kind = %E::KIND, id = new.id(), "no aggregate-relevant change");
        }

        finish(report, failures)
    }

    pub fn on_delete<E: TrackedEntity>(&mut self, entity: &E, log: &mut UndoLog) -> Result<SyncReport> {
        let mut report = SyncReport::new(E::KIND, entity.id());
        let mut failures = Vec::new();

        for metric in E::metrics() {
            let (key, _) = metric.node(entity);
            let tree = self.structures.tree_mut(metric.name);

            match delete_if_tracked(tree, &key) {
                DeleteOutcome::Deleted { value } => {
                    debug!(structure = metric.name, key = %key, "deleted");
                    log.entries.push(UndoEntry::Restore {
                        metric: metric.name,
                        key,
                        value,
                    });
                    report.push(metric.name, SyncAction::Deleted);
                }
                DeleteOutcome::NotTracked => report.push(metric.name, SyncAction::NotTracked),
                DeleteOutcome::Failed(err) => failures.push((metric.name, err)),
            }
        }

        finish(report, failures)
    }

    /// Insert the entity's node into every structure that does not hold it
    /// yet, dropping any node the entity still has under a stale key.
    /// Returns how many structures were touched.
    pub fn track_if_missing<E: TrackedEntity>(&mut self, entity: &E, log: &mut UndoLog) -> Result<usize> {
        entity.validate()?;

        let mut touched = 0;
        for metric in E::metrics() {
            let (key, value) = metric.node(entity);
            let tree = self.structures.tree_mut(metric.name);

            if tree.contains(&key) {
                continue;
            }

            let stale: Vec<AggregateKey> = tree
                .keys_in(&KeyRange::tenant(entity.tenant_id()))
                .into_iter()
                .filter(|k| k.entity_id == entity.id())
                .collect();
            for old in stale {
                let old_value = tree.delete(&old)?;
                debug!(structure = metric.name, key = %old, "dropped stale node");
                log.deleted(metric.name, old, old_value);
            }

            tree.insert(key.clone(), value)?;
            log.inserted(metric.name, key);
            touched += 1;
        }

        Ok(touched)
    }

    /// Undo journaled operations, newest first.
    pub fn rollback(&mut self, log: UndoLog) {
        for entry in log.entries.into_iter().rev() {
            let result = match entry {
                UndoEntry::Remove { metric, key } => {
                    self.structures.tree_mut(metric).delete(&key).map(|_| ())
                }
                UndoEntry::Restore { metric, key, value } => {
                    self.structures.tree_mut(metric).insert(key, value)
                }
            };

            if let Err(err) = result {
                warn!(error = %err, "aggregate rollback step failed");
            }
        }
    }

    /// Bring a tenant's structures in line with its live records: insert
    /// untracked entities, re-key stale nodes, drop nodes of deleted records.
    pub fn reconcile_tenant<E: TrackedEntity>(
        &mut self,
        tenant: &str,
        live: &[E],
        log: &mut UndoLog,
    ) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let mut valid: Vec<&E> = Vec::new();

        for entity in live {
            if entity.tenant_id() != tenant {
                summary.rejected.push((
                    entity.id().to_string(),
                    format!("belongs to tenant {}", entity.tenant_id()),
                ));
            } else if let Err(err) = entity.validate() {
                summary.rejected.push((entity.id().to_string(), err.to_string()));
            } else {
                valid.push(entity);
            }
        }

        let live_ids: HashSet<&str> = valid.iter().map(|e| e.id()).collect();
        let mut inserted: HashSet<&str> = HashSet::new();
        let mut repaired: HashSet<&str> = HashSet::new();
        let mut removed: HashSet<String> = HashSet::new();

        for metric in E::metrics() {
            let tree = self.structures.tree_mut(metric.name);

            let mut tracked: HashMap<String, Vec<AggregateKey>> = HashMap::new();
            for key in tree.keys_in(&KeyRange::tenant(tenant)) {
                tracked.entry(key.entity_id.clone()).or_default().push(key);
            }

            for (entity_id, keys) in &tracked {
                if !live_ids.contains(entity_id.as_str()) {
                    for key in keys {
                        let value = tree.delete(key)?;
                        log.deleted(metric.name, key.clone(), value);
                    }
                    removed.insert(entity_id.clone());
                }
            }

            for entity in &valid {
                let (key, value) = metric.node(*entity);

                match tracked.get(entity.id()) {
                    Some(keys) if keys.len() == 1 && keys[0] == key && tree.get(&key) == Some(value) => {}
                    Some(keys) => {
                        for stale in keys {
                            let old_value = tree.delete(stale)?;
                            log.deleted(metric.name, stale.clone(), old_value);
                        }
                        tree.insert(key.clone(), value)?;
                        log.inserted(metric.name, key);
                        repaired.insert(entity.id());
                    }
                    None => {
                        tree.insert(key.clone(), value)?;
                        log.inserted(metric.name, key);
                        inserted.insert(entity.id());
                    }
                }
            }
        }

        summary.inserted = inserted.len();
        summary.repaired = repaired.difference(&inserted).count();
        summary.removed = removed.len();
        summary.unchanged = valid
            .iter()
            .filter(|e| !inserted.contains(e.id()) && !repaired.contains(e.id()))
            .count();

        Ok(summary)
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    pub fn range(&self, metric: &str, range: &KeyRange) -> Result<RangeStats> {
        if !metric_names().iter().any(|name| *name == metric) {
            return Err(EngineError::validation("metric", format!("unknown metric `{}`", metric)).into());
        }

        match self.structures.get(metric) {
            Some(tree) => Ok(tree.range(range)?),
            None => {
                range.validate()?;
                Ok(RangeStats::default())
            }
        }
    }

    pub fn range_sum(&self, metric: &str, range: &KeyRange) -> Result<i64> {
        Ok(self.range(metric, range)?.sum)
    }

    pub fn range_count(&self, metric: &str, range: &KeyRange) -> Result<u64> {
        Ok(self.range(metric, range)?.count)
    }
}

/// Fail with the first structure fault after logging all of them.
fn finish(report: SyncReport, failures: Vec<(&'static str, anyhow::Error)>) -> Result<SyncReport> {
    let mut failures = failures.into_iter();
    let Some((metric, first)) = failures.next() else {
        return Ok(report);
    };

    warn!(kind = %report.kind, id = %report.entity_id, structure = metric, error = %first, "aggregate sync failed");
    for (other, err) in failures {
        warn!(kind = %report.kind, id = %report.entity_id, structure = other, error = %err, "aggregate sync failed");
    }

    Err(first.context(format!(
        "syncing {} {} into `{}`",
        report.kind, report.entity_id, metric
    )))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Client, ClientStatus, Invoice, InvoiceStatus};
    use crate::error::ErrorCode;

    fn paid_revenue(sync: &AggregateSync, tenant: &str) -> i64 {
        sync.range_sum("invoice_revenue", &KeyRange::tenant(tenant).bucket("paid"))
            .unwrap()
    }

    fn paid_count(sync: &AggregateSync, tenant: &str) -> u64 {
        sync.range_count("invoice_count", &KeyRange::tenant(tenant).bucket("paid"))
            .unwrap()
    }

    #[test]
    fn test_marking_invoice_paid_moves_revenue() {
        let mut sync = AggregateSync::new();
        let mut log = UndoLog::new();

        let sent = Invoice::new("t1").with_total(10_000).with_status(InvoiceStatus::Sent);
        let paid = Invoice::new("t1").with_total(25_000).with_status(InvoiceStatus::Paid);
        sync.on_create(&sent, &mut log).unwrap();
        sync.on_create(&paid, &mut log).unwrap();

        assert_eq!(paid_revenue(&sync, "t1"), 25_000);
        assert_eq!(paid_count(&sync, "t1"), 1);

        let mut now_paid = sent.clone();
        now_paid.mark_paid(sent.issued_at);
        let report = sync.on_update(&sent, &now_paid, &mut log).unwrap();

        assert_eq!(report.action("invoice_count"), Some(SyncAction::Replaced));
        assert_eq!(report.action("invoice_revenue"), Some(SyncAction::Replaced));
        assert_eq!(paid_revenue(&sync, "t1"), 35_000);
        assert_eq!(paid_count(&sync, "t1"), 2);
    }

    #[test]
    fn test_irrelevant_update_touches_nothing() {
        let mut sync = AggregateSync::new();
        let mut log = UndoLog::new();

        let client = Client::new("t1", "Acme");
        sync.on_create(&client, &mut log).unwrap();
        let revision = sync.structures().get("clients").unwrap().revision();
        let logged = log.len();

        let mut renamed = client.clone();
        renamed.name = "Acme Holdings".to_string();
        let report = sync.on_update(&client, &renamed, &mut log).unwrap();

        assert_eq!(report.mutations(), 0);
        assert_eq!(report.action("clients"), Some(SyncAction::Unchanged));
        assert_eq!(sync.structures().get("clients").unwrap().revision(), revision);
        assert_eq!(log.len(), logged);
    }

    #[test]
    fn test_update_of_untracked_entity_self_heals() {
        let mut sync = AggregateSync::new();
        let mut log = UndoLog::new();

        // Predates tracking: never created through the sync layer
        let legacy = Client::new("t1", "Legacy Ltd").with_status(ClientStatus::Lead);
        let active = legacy.clone().with_status(ClientStatus::Active);

        let report = sync.on_update(&legacy, &active, &mut log).unwrap();

        assert_eq!(report.action("clients"), Some(SyncAction::InsertedFresh));
        assert!(report.self_healed());
        assert_eq!(
            sync.range_count("clients", &KeyRange::tenant("t1").bucket("active")).unwrap(),
            1
        );
    }

    #[test]
    fn test_replace_or_insert_outcomes() {
        let mut tree = AggregateTree::new("clients");
        let old = AggregateKey::new("t1", "lead", 1, "c1");
        let new = AggregateKey::new("t1", "active", 1, "c1");

        assert!(matches!(
            replace_or_insert(&mut tree, &old, new.clone(), 0),
            ReplaceOutcome::InsertedFresh
        ));
        assert!(matches!(
            replace_or_insert(&mut tree, &new, old.clone(), 0),
            ReplaceOutcome::Replaced { previous_value: 0 }
        ));

        // Fresh insert that collides with an existing node is a genuine fault
        let other = AggregateKey::new("t1", "lead", 1, "c0");
        match replace_or_insert(&mut tree, &other, old.clone(), 0) {
            ReplaceOutcome::Failed(err) => {
                let code = err.downcast_ref::<EngineError>().map(EngineError::code);
                assert_eq!(code, Some(ErrorCode::DuplicateKey));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_double_delete_never_undercounts() {
        let mut sync = AggregateSync::new();
        let mut log = UndoLog::new();

        let invoice = Invoice::new("t1").with_total(5_000).with_status(InvoiceStatus::Paid);
        sync.on_create(&invoice, &mut log).unwrap();

        let first = sync.on_delete(&invoice, &mut log).unwrap();
        let second = sync.on_delete(&invoice, &mut log).unwrap();

        assert_eq!(first.action("invoice_revenue"), Some(SyncAction::Deleted));
        assert_eq!(second.action("invoice_revenue"), Some(SyncAction::NotTracked));
        assert_eq!(paid_count(&sync, "t1"), 0);
        assert_eq!(paid_revenue(&sync, "t1"), 0);
    }

    #[test]
    fn test_negative_amount_is_rejected_before_any_mutation() {
        let mut sync = AggregateSync::new();
        let mut log = UndoLog::new();

        let invoice = Invoice::new("t1").with_total(-100);
        let err = sync.on_create(&invoice, &mut log).unwrap_err();

        assert_eq!(
            err.downcast_ref::<EngineError>().map(EngineError::code),
            Some(ErrorCode::Validation)
        );
        assert!(log.is_empty());
    }

    #[test]
    fn test_one_structure_failing_does_not_block_the_other() {
        let mut sync = AggregateSync::new();
        let mut log = UndoLog::new();

        let invoice = Invoice::new("t1").with_total(7_000).with_status(InvoiceStatus::Sent);

        // Count structure already holds the node (e.g. a half-applied import)
        let (count_key, _) = Invoice::metrics()[0].node(&invoice);
        sync.structures.tree_mut("invoice_count").insert(count_key, 0).unwrap();

        let err = sync.on_create(&invoice, &mut log).unwrap_err();
        assert!(err.to_string().contains("invoice_count"));

        // Revenue was still attempted and journaled
        assert_eq!(log.len(), 1);
        assert_eq!(
            sync.range_sum("invoice_revenue", &KeyRange::tenant("t1")).unwrap(),
            7_000
        );

        sync.rollback(log);
        assert_eq!(
            sync.range_sum("invoice_revenue", &KeyRange::tenant("t1")).unwrap(),
            0
        );
        assert_eq!(
            sync.range_count("invoice_count", &KeyRange::tenant("t1")).unwrap(),
            1
        );
    }

    #[test]
    fn test_rollback_restores_replaced_nodes() {
        let mut sync = AggregateSync::new();
        let mut setup = UndoLog::new();

        let sent = Invoice::new("t1").with_total(10_000).with_status(InvoiceStatus::Sent);
        sync.on_create(&sent, &mut setup).unwrap();

        let mut log = UndoLog::new();
        let mut paid = sent.clone();
        paid.mark_paid(sent.issued_at);
        sync.on_update(&sent, &paid, &mut log).unwrap();
        assert_eq!(paid_revenue(&sync, "t1"), 10_000);

        sync.rollback(log);
        assert_eq!(paid_revenue(&sync, "t1"), 0);
        assert_eq!(
            sync.range_sum("invoice_revenue", &KeyRange::tenant("t1").bucket("sent")).unwrap(),
            10_000
        );
    }

    #[test]
    fn test_identity_mismatch_is_rejected() {
        let mut sync = AggregateSync::new();
        let mut log = UndoLog::new();

        let a = Client::new("t1", "A");
        let b = Client::new("t1", "B");
        assert!(sync.on_update(&a, &b, &mut log).is_err());
    }

    #[test]
    fn test_reconcile_tenant_is_idempotent() {
        let mut sync = AggregateSync::new();
        let mut log = UndoLog::new();

        let tracked = Client::new("t1", "Tracked");
        let legacy = Client::new("t1", "Legacy");
        let deleted = Client::new("t1", "Gone");
        sync.on_create(&tracked, &mut log).unwrap();
        sync.on_create(&deleted, &mut log).unwrap();

        // Status changed behind the sync layer's back
        let drifted = tracked.clone().with_status(ClientStatus::Inactive);
        let live = vec![drifted, legacy];

        let first = sync.reconcile_tenant("t1", &live, &mut log).unwrap();
        assert_eq!(first.inserted, 1);
        assert_eq!(first.repaired, 1);
        assert_eq!(first.removed, 1);
        assert_eq!(first.unchanged, 0);

        let second = sync.reconcile_tenant("t1", &live, &mut log).unwrap();
        assert_eq!(second.changed(), 0);
        assert_eq!(second.unchanged, 2);

        assert_eq!(
            sync.range_count("clients", &KeyRange::tenant("t1")).unwrap(),
            2
        );
    }

    #[test]
    fn test_track_if_missing_only_fills_gaps() {
        let mut sync = AggregateSync::new();
        let mut log = UndoLog::new();

        let invoice = Invoice::new("t1").with_total(4_200).with_status(InvoiceStatus::Sent);
        let (count_key, _) = Invoice::metrics()[0].node(&invoice);
        sync.structures.tree_mut("invoice_count").insert(count_key, 0).unwrap();

        assert_eq!(sync.track_if_missing(&invoice, &mut log).unwrap(), 1);
        assert_eq!(sync.track_if_missing(&invoice, &mut log).unwrap(), 0);
        assert_eq!(log.len(), 1);
        assert_eq!(
            sync.range_sum("invoice_revenue", &KeyRange::tenant("t1").bucket("sent")).unwrap(),
            4_200
        );
    }

    #[test]
    fn test_reconcile_rolls_back_as_a_unit() {
        let mut sync = AggregateSync::new();
        let mut setup = UndoLog::new();

        let kept = Client::new("t1", "Kept");
        let gone = Client::new("t1", "Gone");
        sync.on_create(&kept, &mut setup).unwrap();
        sync.on_create(&gone, &mut setup).unwrap();

        let live = vec![kept.clone().with_status(ClientStatus::Lead), Client::new("t1", "New")];
        let mut log = UndoLog::new();
        let summary = sync.reconcile_tenant("t1", &live, &mut log).unwrap();
        assert_eq!(summary.changed(), 3);
        assert_eq!(log.touched().into_iter().collect::<Vec<_>>(), vec!["clients"]);

        sync.rollback(log);
        let tree = sync.structures().get("clients").unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree.contains(&Client::metrics()[0].node(&kept).0));
        assert!(tree.contains(&Client::metrics()[0].node(&gone).0));
    }

    #[test]
    fn test_track_if_missing_replaces_stale_node() {
        let mut sync = AggregateSync::new();
        let mut log = UndoLog::new();

        let lead = Client::new("t1", "Acme").with_status(ClientStatus::Lead);
        sync.on_create(&lead, &mut log).unwrap();

        // Record moved on while the structure still holds the lead node
        let active = lead.clone().with_status(ClientStatus::Active);
        assert_eq!(sync.track_if_missing(&active, &mut log).unwrap(), 1);

        assert_eq!(sync.range_count("clients", &KeyRange::tenant("t1")).unwrap(), 1);
        assert_eq!(
            sync.range_count("clients", &KeyRange::tenant("t1").bucket("active")).unwrap(),
            1
        );
    }

    #[test]
    fn test_unknown_metric_is_rejected() {
        let sync = AggregateSync::new();
        assert!(sync.range_sum("payments", &KeyRange::tenant("t1")).is_err());
        assert_eq!(sync.range_sum("quotes", &KeyRange::tenant("t1")).unwrap(), 0);
    }
}
