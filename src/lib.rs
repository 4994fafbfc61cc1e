// Records Aggregates - Core Library
// Exposes all modules for use in the CLI, the read API server, and tests

pub mod aggregate;     // Sorted aggregate structures (treap arena)
pub mod classifier;    // Missing-key vs genuine fault
pub mod config;
pub mod db;            // SQLite record store
pub mod engine;        // Mutations + aggregate sync in one transaction
pub mod entities;      // Clients, projects, quotes, invoices
pub mod error;
pub mod idgen;         // Collision-safe identifier generator
pub mod import;        // CSV bulk load
pub mod logging;
pub mod migrations;    // Counter, totals and aggregate backfills
pub mod reporting;     // Tenant summaries from range queries
pub mod sequence;      // Per-tenant document numbering
pub mod sync;          // Aggregate sync layer

// Re-export commonly used types
pub use aggregate::{AggregateKey, AggregateSet, AggregateTree, KeyRange, RangeStats};
pub use classifier::{classify, is_missing_key_error, FaultClass};
pub use config::{EngineConfig, IdentifierConfig, NumberingConfig};
pub use engine::Engine;
pub use entities::{
    Client, ClientStatus, EntityKind, Invoice, InvoiceStatus, LineItem, Project, ProjectStatus,
    Quote, QuoteStatus, TrackedEntity,
};
pub use error::{EngineError, ErrorCode, MISSING_KEY_MARKER};
pub use idgen::{generate_unique, Sleeper, UniqueIdGenerator};
pub use import::{import_csv, ImportMode, ImportReport};
pub use migrations::{
    backfill_aggregates, backfill_counters, reconcile_aggregates, repair_invoice_totals,
    MigrationError, MigrationReport,
};
pub use reporting::{tenant_summary, TenantSummary};
pub use sequence::DocumentKind;
pub use sync::{AggregateSync, DeleteOutcome, ReplaceOutcome, SyncAction, SyncReport, UndoLog};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
