// 🏭 Engine - business mutations with their aggregate sync
//
// Each mutation runs the record change and the matching sync call inside
// one SQLite transaction. Structure operations are journaled in an UndoLog;
// every structure the journal touched is written to the aggregates table on
// the same transaction, and the journal is undone in memory if the
// transaction aborts or fails to commit. Store and structures move together
// or not at all, on disk as well as in memory.

use crate::aggregate::{KeyRange, RangeStats};
use crate::config::EngineConfig;
use crate::db::{self, TenantInsert};
use crate::entities::TrackedEntity;
use crate::error::EngineError;
use crate::idgen::UniqueIdGenerator;
use crate::sequence::{self, DocumentKind};
use crate::sync::{AggregateSync, SyncReport, UndoLog};
use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use tracing::{debug, info, warn};

/// Insert attempts when the unique constraint fires after a clean pre-check
const PROVISION_ROUNDS: u32 = 3;

pub struct Engine {
    conn: Connection,
    sync: AggregateSync,
    config: EngineConfig,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        let conn = Connection::open(&config.database_path).with_context(|| {
            format!("Failed to open database {}", config.database_path.display())
        })?;
        Self::from_connection(conn, config)
    }

    pub fn open_in_memory(config: EngineConfig) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    /// Set up the schema and load the last aggregate checkpoint
    pub fn from_connection(conn: Connection, config: EngineConfig) -> Result<Self> {
        db::setup_database(&conn).context("Failed to set up database schema")?;
        let structures = db::load_aggregates(&conn)?;

        info!(
            structures = structures.trees().count(),
            nodes = structures.trees().map(|t| t.len()).sum::<usize>(),
            "engine opened"
        );

        Ok(Engine {
            conn,
            sync: AggregateSync::from_set(structures),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn sync(&self) -> &AggregateSync {
        &self.sync
    }

    /// Run `op` in one all-or-nothing unit across the store and structures.
    pub fn in_transaction<T, F>(&mut self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection, &mut AggregateSync, &mut UndoLog) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        let mut log = UndoLog::new();

        let result = match op(&*tx, &mut self.sync, &mut log) {
            Ok(value) => save_touched(&tx, &self.sync, &log).map(|()| value),
            Err(err) => Err(err),
        };

        match result {
            Ok(value) => match tx.commit() {
                Ok(()) => Ok(value),
                Err(err) => {
                    self.sync.rollback(log);
                    Err(err).context("Failed to commit transaction")
                }
            },
            Err(err) => {
                drop(tx);
                if !log.is_empty() {
                    debug!(steps = log.len(), "rolling back aggregate changes");
                }
                self.sync.rollback(log);
                Err(err)
            }
        }
    }

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    pub fn create<E: TrackedEntity>(&mut self, entity: &E) -> Result<SyncReport> {
        entity.validate()?;

        self.in_transaction(|conn, sync, log| {
            db::insert_record(conn, entity)?;
            sync.on_create(entity, log)
        })
    }

    /// Store a new snapshot; the before snapshot is the stored record.
    pub fn update<E: TrackedEntity>(&mut self, entity: &E) -> Result<SyncReport> {
        entity.validate()?;

        self.in_transaction(|conn, sync, log| {
            let old: E = db::get_record(conn, entity.id())?
                .filter(|old: &E| old.tenant_id() == entity.tenant_id())
                .ok_or_else(|| {
                    anyhow!("{} {} not found for tenant {}", E::KIND, entity.id(), entity.tenant_id())
                })?;

            db::patch_record(conn, entity)?;
            sync.on_update(&old, entity, log)
        })
    }

    /// Delete a record. Returns None if it was not there.
    pub fn delete<E: TrackedEntity>(&mut self, tenant_id: &str, id: &str) -> Result<Option<SyncReport>> {
        self.in_transaction(|conn, sync, log| {
            let existing: Option<E> = db::get_record(conn, id)?;
            let Some(old) = existing.filter(|old| old.tenant_id() == tenant_id) else {
                debug!(kind = %E::KIND, id, tenant = tenant_id, "delete of absent record");
                return Ok(None);
            };

            db::delete_record(conn, E::KIND, id)?;
            sync.on_delete(&old, log).map(Some)
        })
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    pub fn range(&self, metric: &str, range: &KeyRange) -> Result<RangeStats> {
        self.sync.range(metric, range)
    }

    pub fn range_sum(&self, metric: &str, range: &KeyRange) -> Result<i64> {
        self.sync.range_sum(metric, range)
    }

    pub fn range_count(&self, metric: &str, range: &KeyRange) -> Result<u64> {
        self.sync.range_count(metric, range)
    }

    // ========================================================================
    // SEQUENCES
    // ========================================================================

    pub fn next_sequence(&mut self, tenant_id: &str, kind: DocumentKind) -> Result<i64> {
        if tenant_id.is_empty() {
            return Err(EngineError::validation("tenant_id", "must not be empty").into());
        }
        self.in_transaction(|conn, _, _| sequence::next_sequence(conn, tenant_id, kind))
    }

    /// Next formatted number, e.g. "INV-0042"
    pub fn mint_document_number(&mut self, tenant_id: &str, kind: DocumentKind) -> Result<String> {
        let seq = self.next_sequence(tenant_id, kind)?;
        Ok(self.config.numbering.format(kind, seq))
    }

    // ========================================================================
    // TENANT PROVISIONING
    // ========================================================================

    /// The tenant's inbound address, minting one on first call
    pub fn provision_tenant(&mut self, tenant_id: &str) -> Result<String> {
        let mut generator = UniqueIdGenerator::for_domain(&self.config.identifiers);
        self.provision_tenant_with(tenant_id, &mut generator)
    }

    pub fn provision_tenant_with(
        &mut self,
        tenant_id: &str,
        generator: &mut UniqueIdGenerator,
    ) -> Result<String> {
        if tenant_id.is_empty() {
            return Err(EngineError::validation("tenant_id", "must not be empty").into());
        }

        if let Some(existing) = db::tenant_address(&self.conn, tenant_id)? {
            debug!(tenant = tenant_id, "tenant already provisioned");
            return Ok(existing);
        }

        for round in 1..=PROVISION_ROUNDS {
            let conn = &self.conn;
            let address = generator
                .generate_unique(|candidate| db::address_exists(conn, candidate))
                .with_context(|| format!("Failed to mint inbound address for {}", tenant_id))?;

            match db::insert_tenant(conn, tenant_id, &address)? {
                TenantInsert::Inserted => {
                    info!(tenant = tenant_id, address = %address, "tenant provisioned");
                    return Ok(address);
                }
                TenantInsert::AddressTaken => {
                    warn!(tenant = tenant_id, round, "address claimed at insert; regenerating");
                }
            }
        }

        Err(EngineError::ExhaustedRetries {
            attempts: PROVISION_ROUNDS,
        })
        .with_context(|| format!("Failed to provision tenant {}", tenant_id))
    }

    // ========================================================================
    // CHECKPOINT
    // ========================================================================

    /// Persist every structure, including ones no mutation has touched
    /// yet; returns how many were written
    pub fn checkpoint(&mut self) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut saved = 0;

        for tree in self.sync.structures().trees() {
            db::save_aggregate(&tx, tree)
                .with_context(|| format!("Failed to checkpoint `{}`", tree.name()))?;
            saved += 1;
        }

        tx.commit()?;
        info!(structures = saved, "aggregates checkpointed");
        Ok(saved)
    }
}

/// Write the structures `log` touched, on the caller's transaction
fn save_touched(conn: &Connection, sync: &AggregateSync, log: &UndoLog) -> Result<()> {
    for name in log.touched() {
        if let Some(tree) = sync.structures().get(name) {
            db::save_aggregate(conn, tree)
                .with_context(|| format!("Failed to persist `{}`", name))?;
        }
    }
    Ok(())
}
