// 🗄️ Record Store - SQLite document store
//
// Tracked entities are stored as JSON documents keyed by (kind, id) with a
// (kind, tenant_id) index for per-tenant scans. Alongside them:
// - counters: per-tenant sequence state for document numbers
// - tenants: the tenant registry with each tenant's inbound address
// - aggregates: checkpoints of the sorted aggregate structures
//
// Every function takes a &Connection, so callers can pass either a plain
// connection or an open rusqlite::Transaction.

use crate::aggregate::{AggregateSet, AggregateTree};
use crate::entities::{EntityKind, TrackedEntity};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Records (JSON documents, one row per live entity)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS records (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            status TEXT NOT NULL,
            number TEXT,
            body TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (kind, id)
        )",
        [],
    )?;

    // ==========================================================================
    // Counters (sequence minting)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS counters (
            tenant_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            value INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, kind)
        )",
        [],
    )?;

    // ==========================================================================
    // Tenants (inbound address is globally unique)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS tenants (
            tenant_id TEXT PRIMARY KEY,
            inbound_address TEXT UNIQUE NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Aggregate checkpoints
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS aggregates (
            name TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            node_count INTEGER NOT NULL,
            saved_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_tenant ON records(kind, tenant_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// RECORDS
// ============================================================================

pub fn insert_record<E: TrackedEntity>(conn: &Connection, entity: &E) -> Result<()> {
    let body = serde_json::to_string(entity)?;

    let result = conn.execute(
        "INSERT INTO records (kind, id, tenant_id, status, number, body, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            E::KIND.as_str(),
            entity.id(),
            entity.tenant_id(),
            entity.status_str(),
            entity.document_number(),
            body,
            Utc::now().to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            bail!("{} {} already exists", E::KIND, entity.id())
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_record<E: TrackedEntity>(conn: &Connection, id: &str) -> Result<Option<E>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM records WHERE kind = ?1 AND id = ?2",
            params![E::KIND.as_str(), id],
            |row| row.get(0),
        )
        .optional()?;

    body.map(|json| decode::<E>(id, &json)).transpose()
}

/// Overwrite a stored record with a full new snapshot
pub fn patch_record<E: TrackedEntity>(conn: &Connection, entity: &E) -> Result<()> {
    let body = serde_json::to_string(entity)?;

    let changed = conn.execute(
        "UPDATE records
         SET status = ?1, number = ?2, body = ?3, updated_at = ?4
         WHERE kind = ?5 AND id = ?6 AND tenant_id = ?7",
        params![
            entity.status_str(),
            entity.document_number(),
            body,
            Utc::now().to_rfc3339(),
            E::KIND.as_str(),
            entity.id(),
            entity.tenant_id(),
        ],
    )?;

    if changed == 0 {
        bail!("{} {} not found for tenant {}", E::KIND, entity.id(), entity.tenant_id());
    }
    Ok(())
}

pub fn delete_record(conn: &Connection, kind: EntityKind, id: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM records WHERE kind = ?1 AND id = ?2",
        params![kind.as_str(), id],
    )?;
    Ok(deleted > 0)
}

/// Raw (id, body) rows of one tenant, for callers that decode per record
pub fn scan_tenant_raw(conn: &Connection, kind: EntityKind, tenant_id: &str) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT id, body FROM records
         WHERE kind = ?1 AND tenant_id = ?2
         ORDER BY id",
    )?;

    let rows = stmt
        .query_map(params![kind.as_str(), tenant_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub fn scan_tenant<E: TrackedEntity>(conn: &Connection, tenant_id: &str) -> Result<Vec<E>> {
    scan_tenant_raw(conn, E::KIND, tenant_id)?
        .iter()
        .map(|(id, body)| decode::<E>(id, body))
        .collect()
}

/// Document numbers present among a tenant's live records
pub fn document_numbers(conn: &Connection, kind: EntityKind, tenant_id: &str) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT id, number FROM records
         WHERE kind = ?1 AND tenant_id = ?2 AND number IS NOT NULL
         ORDER BY id",
    )?;

    let rows = stmt
        .query_map(params![kind.as_str(), tenant_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub fn tenants_with_records(conn: &Connection, kind: EntityKind) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT tenant_id FROM records WHERE kind = ?1 ORDER BY tenant_id",
    )?;

    let tenants = stmt
        .query_map([kind.as_str()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;

    Ok(tenants)
}

pub fn count_records(conn: &Connection, kind: EntityKind, tenant_id: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM records WHERE kind = ?1 AND tenant_id = ?2",
        params![kind.as_str(), tenant_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn decode<E: TrackedEntity>(id: &str, body: &str) -> Result<E> {
    serde_json::from_str(body).with_context(|| format!("Failed to decode {} {}", E::KIND, id))
}

// ============================================================================
// COUNTERS
// ============================================================================

pub fn get_counter(conn: &Connection, tenant_id: &str, kind: &str) -> Result<Option<i64>> {
    let value = conn
        .query_row(
            "SELECT value FROM counters WHERE tenant_id = ?1 AND kind = ?2",
            params![tenant_id, kind],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Create the counter; fails if it already exists
pub fn init_counter(conn: &Connection, tenant_id: &str, kind: &str, value: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO counters (tenant_id, kind, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
        params![tenant_id, kind, value, Utc::now().to_rfc3339()],
    )
    .with_context(|| format!("Failed to initialize {} counter for {}", kind, tenant_id))?;
    Ok(())
}

/// Advance an existing counter by one and return the new value
pub fn advance_counter(conn: &Connection, tenant_id: &str, kind: &str) -> Result<i64> {
    let value = conn
        .query_row(
            "UPDATE counters SET value = value + 1, updated_at = ?3
             WHERE tenant_id = ?1 AND kind = ?2
             RETURNING value",
            params![tenant_id, kind, Utc::now().to_rfc3339()],
            |row| row.get(0),
        )
        .optional()?;

    value.ok_or_else(|| anyhow!("no {} counter for tenant {}", kind, tenant_id))
}

// ============================================================================
// TENANTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantInsert {
    Inserted,
    /// Another tenant claimed the address between check and insert
    AddressTaken,
}

pub fn tenant_address(conn: &Connection, tenant_id: &str) -> Result<Option<String>> {
    let address = conn
        .query_row(
            "SELECT inbound_address FROM tenants WHERE tenant_id = ?1",
            [tenant_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(address)
}

pub fn address_exists(conn: &Connection, address: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM tenants WHERE inbound_address = ?1",
            [address],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Insert a new tenant. The caller checks the tenant is not already
/// registered, so a constraint violation here means the address is taken.
pub fn insert_tenant(conn: &Connection, tenant_id: &str, address: &str) -> Result<TenantInsert> {
    let result = conn.execute(
        "INSERT INTO tenants (tenant_id, inbound_address, created_at) VALUES (?1, ?2, ?3)",
        params![tenant_id, address, Utc::now().to_rfc3339()],
    );

    match result {
        Ok(_) => Ok(TenantInsert::Inserted),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(TenantInsert::AddressTaken)
        }
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// AGGREGATE CHECKPOINTS
// ============================================================================

pub fn save_aggregate(conn: &Connection, tree: &AggregateTree) -> Result<()> {
    let data = serde_json::to_string(tree)?;

    conn.execute(
        "INSERT INTO aggregates (name, data, node_count, saved_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name) DO UPDATE SET
            data = excluded.data,
            node_count = excluded.node_count,
            saved_at = excluded.saved_at",
        params![tree.name(), data, tree.len() as i64, Utc::now().to_rfc3339()],
    )?;

    Ok(())
}

pub fn load_aggregates(conn: &Connection) -> Result<AggregateSet> {
    let mut stmt = conn.prepare("SELECT name, data FROM aggregates ORDER BY name")?;

    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut set = AggregateSet::new();
    for (name, data) in rows {
        let tree: AggregateTree = serde_json::from_str(&data)
            .with_context(|| format!("Failed to decode aggregate checkpoint `{}`", name))?;
        set.install(tree);
    }

    Ok(set)
}
