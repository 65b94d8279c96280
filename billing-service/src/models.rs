use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::{LedgerError, SagaState};
use uuid::Uuid;

/// A nota fiscal. `status` holds the saga state of the invoice.
#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::invoices)]
pub struct Invoice {
    pub id: Uuid,
    pub number: String,
    pub status: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn new(number: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            number: number.into(),
            status: SagaState::Created.as_str().to_string(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> Result<SagaState, LedgerError> {
        self.status.parse().map_err(LedgerError::Corrupt)
    }

    pub fn moved_to(self, state: SagaState) -> Self {
        Self {
            status: state.as_str().to_string(),
            updated_at: Utc::now(),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::invoice_items)]
pub struct InvoiceItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub created_at: DateTime<Utc>,
}

impl InvoiceItem {
    pub fn new(invoice_id: Uuid, product_id: Uuid, quantity: i32, unit_price: BigDecimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            invoice_id,
            product_id,
            quantity,
            unit_price,
            created_at: Utc::now(),
        }
    }

    pub fn line_total(&self) -> BigDecimal {
        &self.unit_price * BigDecimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceWithItems {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub items: Vec<InvoiceItem>,
}

impl InvoiceWithItems {
    pub fn total(&self) -> BigDecimal {
        self.items.iter().map(InvoiceItem::line_total).sum()
    }
}
