// Aggregate keys and range predicates
//
// Keys order lexicographically by (tenant, bucket, at, entity_id). A range
// is a contiguous stretch of that order, so a query only ever has to find
// its two boundaries.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    /// Owning tenant
    pub tenant: String,

    /// Status bucket ("paid", "active", ...)
    pub bucket: String,

    /// Sort timestamp in milliseconds
    pub at: i64,

    /// Tie-breaker: one node per entity
    pub entity_id: String,
}

impl AggregateKey {
    pub fn new(
        tenant: impl Into<String>,
        bucket: impl Into<String>,
        at: i64,
        entity_id: impl Into<String>,
    ) -> Self {
        AggregateKey {
            tenant: tenant.into(),
            bucket: bucket.into(),
            at,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.tenant, self.bucket, self.at, self.entity_id
        )
    }
}

// ============================================================================
// KEY RANGE
// ============================================================================

/// Query predicate: one tenant, optionally one bucket, optionally a
/// half-open time window `[from, until)` inside that bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub tenant: String,
    pub bucket: Option<String>,
    pub from: Option<i64>,
    pub until: Option<i64>,
}

impl KeyRange {
    /// Every node of a tenant
    pub fn tenant(tenant: impl Into<String>) -> Self {
        KeyRange {
            tenant: tenant.into(),
            bucket: None,
            from: None,
            until: None,
        }
    }

    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn since(mut self, from: i64) -> Self {
        self.from = Some(from);
        self
    }

    pub fn until(mut self, until: i64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn between(self, from: i64, until: i64) -> Self {
        self.since(from).until(until)
    }

    /// A time window spans every bucket unless a bucket is fixed, and then
    /// the matching keys are no longer contiguous.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.bucket.is_none() && (self.from.is_some() || self.until.is_some()) {
            return Err(EngineError::validation(
                "range",
                "a time window requires a bucket",
            ));
        }
        Ok(())
    }

    /// Where a key sits relative to the range: before it, inside it, or after it.
    ///
    /// Monotone over key order, which is what makes boundary descent work.
    pub fn position(&self, key: &AggregateKey) -> Ordering {
        match key.tenant.as_str().cmp(self.tenant.as_str()) {
            Ordering::Equal => {}
            other => return other,
        }

        let Some(bucket) = &self.bucket else {
            return Ordering::Equal;
        };

        match key.bucket.as_str().cmp(bucket.as_str()) {
            Ordering::Equal => {}
            other => return other,
        }

        if let Some(from) = self.from {
            if key.at < from {
                return Ordering::Less;
            }
        }

        if let Some(until) = self.until {
            if key.at >= until {
                return Ordering::Greater;
            }
        }

        Ordering::Equal
    }

    pub fn contains(&self, key: &AggregateKey) -> bool {
        self.position(key) == Ordering::Equal
    }
}
