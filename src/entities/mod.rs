// Tracked Entities - business records that feed aggregate structures
//
// Each entity type declares its metrics: a name plus a projection from a
// full snapshot to (bucket, at, value). The sync layer never looks at
// entity fields directly, it only compares projections.

pub mod client;
pub mod invoice;
pub mod project;
pub mod quote;

pub use client::{Client, ClientStatus};
pub use invoice::{Invoice, InvoiceStatus};
pub use project::{Project, ProjectStatus};
pub use quote::{Quote, QuoteStatus};

use crate::aggregate::AggregateKey;
use crate::error::EngineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ENTITY KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Client,
    Project,
    Quote,
    Invoice,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Client,
        EntityKind::Project,
        EntityKind::Quote,
        EntityKind::Invoice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Client => "client",
            EntityKind::Project => "project",
            EntityKind::Quote => "quote",
            EntityKind::Invoice => "invoice",
        }
    }

    pub fn parse(value: &str) -> Option<EntityKind> {
        match value.trim().to_lowercase().as_str() {
            "client" | "clients" => Some(EntityKind::Client),
            "project" | "projects" => Some(EntityKind::Project),
            "quote" | "quotes" => Some(EntityKind::Quote),
            "invoice" | "invoices" => Some(EntityKind::Invoice),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// What one structure sees of an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub bucket: &'static str,
    pub at: i64,
    pub value: i64,
}

/// A tracked metric: one Sorted Aggregate Structure per metric name
pub struct Metric<E: 'static> {
    pub name: &'static str,
    pub project: fn(&E) -> Projection,
}

impl<E: TrackedEntity> Metric<E> {
    /// Node (key, value) this entity contributes to the metric's structure
    pub fn node(&self, entity: &E) -> (AggregateKey, i64) {
        let projection = (self.project)(entity);
        let key = AggregateKey::new(
            entity.tenant_id(),
            projection.bucket,
            projection.at,
            entity.id(),
        );
        (key, projection.value)
    }
}

/// Every metric name maintained by any entity type
pub fn metric_names() -> Vec<&'static str> {
    Client::metrics()
        .iter()
        .map(|m| m.name)
        .chain(Project::metrics().iter().map(|m| m.name))
        .chain(Quote::metrics().iter().map(|m| m.name))
        .chain(Invoice::metrics().iter().map(|m| m.name))
        .collect()
}

// ============================================================================
// TRACKED ENTITY
// ============================================================================

pub trait TrackedEntity: Clone + fmt::Debug + Serialize + DeserializeOwned + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    fn tenant_id(&self) -> &str;

    fn status_str(&self) -> &'static str;

    /// Structures this entity type maintains
    fn metrics() -> &'static [Metric<Self>];

    /// Reject snapshots that must not reach a structure
    fn validate(&self) -> Result<(), EngineError> {
        if self.id().is_empty() {
            return Err(EngineError::validation("id", "must not be empty"));
        }
        if self.tenant_id().is_empty() {
            return Err(EngineError::validation("tenant_id", "must not be empty"));
        }
        Ok(())
    }

    /// Formatted human-readable number ("INV-0042"), if the type has one
    fn document_number(&self) -> Option<&str> {
        None
    }
}

// ============================================================================
// LINE ITEMS (quotes and invoices)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

impl LineItem {
    pub fn new(description: impl Into<String>, quantity: i64, unit_price_cents: i64) -> Self {
        LineItem {
            description: description.into(),
            quantity,
            unit_price_cents,
        }
    }

    pub fn total_cents(&self) -> Result<i64, EngineError> {
        self.quantity
            .checked_mul(self.unit_price_cents)
            .ok_or_else(|| overflow(&self.description))
    }
}

pub(crate) fn overflow(what: &str) -> EngineError {
    EngineError::validation("line_items", format!("amount overflows on `{}`", what))
}

pub(crate) fn subtotal_cents(items: &[LineItem]) -> Result<i64, EngineError> {
    items.iter().try_fold(0i64, |acc, item| {
        acc.checked_add(item.total_cents()?)
            .ok_or_else(|| overflow(&item.description))
    })
}

pub(crate) fn validate_amounts(total_cents: i64, items: &[LineItem]) -> Result<(), EngineError> {
    if total_cents < 0 {
        return Err(EngineError::validation(
            "total_cents",
            format!("must not be negative (got {})", total_cents),
        ));
    }

    for item in items {
        if item.quantity < 0 || item.unit_price_cents < 0 {
            return Err(EngineError::validation(
                "line_items",
                format!("negative quantity or price on `{}`", item.description),
            ));
        }
    }

    subtotal_cents(items)?;
    Ok(())
}
