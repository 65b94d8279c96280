//! Storage behind the invoice use cases. Every method is one local
//! transaction; state changes that announce something append their outbox
//! event inside it.

mod memory;
mod postgres;

pub use memory::{BillingTables, InMemoryBillingLedger};
pub use postgres::PgBillingLedger;

use async_trait::async_trait;
use shared::{Idempotent, LedgerError};
use uuid::Uuid;

use crate::invoices::{InvoiceError, ReservationReply, Settlement};
use crate::models::{Invoice, InvoiceItem, InvoiceWithItems};

#[async_trait]
pub trait BillingLedger: Send + Sync {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), InvoiceError>;

    /// Only while the invoice is CREATED.
    async fn add_item(&self, item: &InvoiceItem) -> Result<(), InvoiceError>;

    async fn request_reservation(&self, invoice_id: Uuid) -> Result<Invoice, InvoiceError>;

    async fn cancel(&self, invoice_id: Uuid) -> Result<Invoice, InvoiceError>;

    /// Applies a reply from stock. The processed-message marker for `guard`
    /// is inserted even when the reply turns out to be stale.
    async fn settle(
        &self,
        reply: &ReservationReply,
        guard: &str,
    ) -> Result<Idempotent<Settlement>, LedgerError>;

    async fn invoice(&self, invoice_id: Uuid) -> Result<Option<InvoiceWithItems>, LedgerError>;
}
