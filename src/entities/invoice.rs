// 🧾 Invoice Entity
//
// Invoices keep two independent structures:
// - invoice_count: bucketed by status, ordered by issue time
// - invoice_revenue: bucketed by status, ordered by payment time (issue time
//   until paid), valued at the invoice total
//
// A payment-date correction therefore touches only the revenue structure.

use super::{overflow, subtotal_cents, validate_amounts, EntityKind, LineItem, Metric, Projection, TrackedEntity};
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn parse(value: &str) -> Option<InvoiceStatus> {
        match value.trim().to_lowercase().as_str() {
            "draft" => Some(InvoiceStatus::Draft),
            "sent" => Some(InvoiceStatus::Sent),
            "paid" => Some(InvoiceStatus::Paid),
            "overdue" => Some(InvoiceStatus::Overdue),
            "void" => Some(InvoiceStatus::Void),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Formatted number, e.g. "INV-0042"
    #[serde(default)]
    pub number: Option<String>,
    pub status: InvoiceStatus,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    /// Tax rate in basis points (825 = 8.25%)
    #[serde(default)]
    pub tax_rate_bps: u32,
    pub total_cents: i64,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
}

impl Invoice {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Invoice {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            client_id: None,
            number: None,
            status: InvoiceStatus::Draft,
            line_items: Vec::new(),
            tax_rate_bps: 0,
            total_cents: 0,
            issued_at: Utc::now(),
            paid_at: None,
        }
    }

    pub fn with_total(mut self, total_cents: i64) -> Self {
        self.total_cents = total_cents;
        self
    }

    pub fn with_status(mut self, status: InvoiceStatus) -> Self {
        self.status = status;
        self
    }

    /// Leaves the total untouched if the line items overflow; validate() rejects them.
    pub fn with_tax_rate(mut self, tax_rate_bps: u32) -> Self {
        self.tax_rate_bps = tax_rate_bps;
        if let Ok(total) = self.computed_total() {
            self.total_cents = total;
        }
        self
    }

    pub fn with_line_item(mut self, item: LineItem) -> Self {
        self.line_items.push(item);
        if let Ok(total) = self.computed_total() {
            self.total_cents = total;
        }
        self
    }

    /// Subtotal plus tax, tax rounded half-up to the cent
    pub fn computed_total(&self) -> Result<i64, EngineError> {
        let subtotal = subtotal_cents(&self.line_items)?;
        let tax = subtotal
            .checked_mul(self.tax_rate_bps as i64)
            .and_then(|scaled| scaled.checked_add(5_000))
            .map(|scaled| scaled / 10_000)
            .ok_or_else(|| overflow("tax"))?;
        subtotal.checked_add(tax).ok_or_else(|| overflow("tax"))
    }

    pub fn mark_paid(&mut self, at: DateTime<Utc>) {
        self.status = InvoiceStatus::Paid;
        self.paid_at = Some(at);
    }

    pub fn is_paid(&self) -> bool {
        self.status == InvoiceStatus::Paid
    }
}

fn invoice_count_projection(invoice: &Invoice) -> Projection {
    Projection {
        bucket: invoice.status.as_str(),
        at: invoice.issued_at.timestamp_millis(),
        value: 0,
    }
}

fn invoice_revenue_projection(invoice: &Invoice) -> Projection {
    Projection {
        bucket: invoice.status.as_str(),
        at: invoice
            .paid_at
            .unwrap_or(invoice.issued_at)
            .timestamp_millis(),
        value: invoice.total_cents,
    }
}

static INVOICE_METRICS: [Metric<Invoice>; 2] = [
    Metric {
        name: "invoice_count",
        project: invoice_count_projection,
    },
    Metric {
        name: "invoice_revenue",
        project: invoice_revenue_projection,
    },
];

impl TrackedEntity for Invoice {
    const KIND: EntityKind = EntityKind::Invoice;

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
        &INVOICE_METRICS
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.id.is_empty() || self.tenant_id.is_empty() {
            return Err(EngineError::validation("id", "invoice id and tenant are required"));
        }
        validate_amounts(self.total_cents, &self.line_items)?;
        self.computed_total().map(|_| ())
    }

    fn document_number(&self) -> Option<&str> {
        self.number.as_deref()
    }
}
