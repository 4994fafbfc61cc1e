// 📝 Quote Entity
//
// One structure, `quotes`: bucketed by status, ordered by creation time,
// valued at the quote total.

use super::{subtotal_cents, validate_amounts, EntityKind, LineItem, Metric, Projection, TrackedEntity};
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    Draft,
    Sent,
    Accepted,
    Declined,
    Expired,
}

impl QuoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteStatus::Draft => "draft",
            QuoteStatus::Sent => "sent",
            QuoteStatus::Accepted => "accepted",
            QuoteStatus::Declined => "declined",
            QuoteStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<QuoteStatus> {
        match value.trim().to_lowercase().as_str() {
            "draft" => Some(QuoteStatus::Draft),
            "sent" => Some(QuoteStatus::Sent),
            "accepted" => Some(QuoteStatus::Accepted),
            "declined" => Some(QuoteStatus::Declined),
            "expired" => Some(QuoteStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Formatted number, e.g. "Q-0007"
    #[serde(default)]
    pub number: Option<String>,
    pub status: QuoteStatus,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    pub total_cents: i64,
    pub created_at: DateTime<Utc>,
}

impl Quote {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Quote {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            client_id: None,
            number: None,
            status: QuoteStatus::Draft,
            line_items: Vec::new(),
            total_cents: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_line_item(mut self, item: LineItem) -> Self {
        self.line_items.push(item);
        if let Ok(total) = subtotal_cents(&self.line_items) {
            self.total_cents = total;
        }
        self
    }

    pub fn with_status(mut self, status: QuoteStatus) -> Self {
        self.status = status;
        self
    }
}

fn quotes_projection(quote: &Quote) -> Projection {
    Projection {
        bucket: quote.status.as_str(),
        at: quote.created_at.timestamp_millis(),
        value: quote.total_cents,
    }
}

static QUOTE_METRICS: [Metric<Quote>; 1] = [Metric {
    name: "quotes",
    project: quotes_projection,
}];

impl TrackedEntity for Quote {
    const KIND: EntityKind = EntityKind::Quote;

    fn id(&self) -> &str {
        &self.id
    }

    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    fn status_str(&self) -> &'static str {
        self.status.as_str()
    }

    fn metrics() -> &'static [Metric<Self>] {
        &QUOTE_METRICS
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.id.is_empty() || self.tenant_id.is_empty() {
            return Err(EngineError::validation("id", "quote id and tenant are required"));
        }
        validate_amounts(self.total_cents, &self.line_items)
    }

    fn document_number(&self) -> Option<&str> {
        self.number.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_total_follows_line_items() {
        let quote = Quote::new("t1")
            .with_line_item(LineItem::new("Discovery", 4, 12_500))
            .with_line_item(LineItem::new("Prototype", 1, 80_000));

        assert_eq!(quote.total_cents, 130_000);
        assert_eq!(Quote::metrics()[0].node(&quote).1, 130_000);
    }

    #[test]
    fn test_negative_total_is_invalid() {
        let mut quote = Quote::new("t1");
        quote.total_cents = -500;

        let err = quote.validate().unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }
}
