use async_trait::async_trait;
use shared::{Idempotent, LedgerError, MemoryLedger, NewOutboxEvent, SagaState};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::BillingLedger;
use crate::invoices::{
    apply_reply, cancel_saga, start_saga, InvoiceError, ReservationReply, Settlement,
};
use crate::models::{Invoice, InvoiceItem, InvoiceWithItems};

#[derive(Debug, Clone, Default)]
pub struct BillingTables {
    pub invoices: BTreeMap<Uuid, Invoice>,
    pub items: Vec<InvoiceItem>,
}

impl BillingTables {
    fn items_of(&self, invoice_id: Uuid) -> Vec<InvoiceItem> {
        self.items
            .iter()
            .filter(|item| item.invoice_id == invoice_id)
            .cloned()
            .collect()
    }
}

pub type InMemoryBillingLedger = MemoryLedger<BillingTables>;

#[async_trait]
impl BillingLedger for MemoryLedger<BillingTables> {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), InvoiceError> {
        self.transaction(|state| {
            if state.tables.invoices.values().any(|i| i.number == invoice.number) {
                return Err(InvoiceError::DuplicateNumber(invoice.number.clone()));
            }
            state.tables.invoices.insert(invoice.id, invoice.clone());
            Ok(())
        })
        .await
    }

    async fn add_item(&self, item: &InvoiceItem) -> Result<(), InvoiceError> {
        self.transaction(|state| {
            let invoice = state
                .tables
                .invoices
                .get(&item.invoice_id)
                .ok_or(InvoiceError::NotFound(item.invoice_id))?;
            let current = invoice.state()?;
            if current != SagaState::Created {
                return Err(InvoiceError::NotOpen {
                    invoice_id: item.invoice_id,
                    state: current,
                });
            }
            state.tables.items.push(item.clone());
            Ok(())
        })
        .await
    }

    async fn request_reservation(&self, invoice_id: Uuid) -> Result<Invoice, InvoiceError> {
        self.transaction(|state| {
            let invoice = state
                .tables
                .invoices
                .get(&invoice_id)
                .ok_or(InvoiceError::NotFound(invoice_id))?;
            let (updated, event) = start_saga(invoice, &state.tables.items_of(invoice_id))?;

            state.outbox.insert(NewOutboxEvent::from_event(&event).map_err(LedgerError::from)?);
            state.tables.invoices.insert(invoice_id, updated.clone());
            Ok(updated)
        })
        .await
    }

    async fn cancel(&self, invoice_id: Uuid) -> Result<Invoice, InvoiceError> {
        self.transaction(|state| {
            let invoice = state
                .tables
                .invoices
                .get(&invoice_id)
                .ok_or(InvoiceError::NotFound(invoice_id))?;
            let (updated, event) = cancel_saga(invoice)?;

            state.outbox.insert(NewOutboxEvent::from_event(&event).map_err(LedgerError::from)?);
            state.tables.invoices.insert(invoice_id, updated.clone());
            Ok(updated)
        })
        .await
    }

    async fn settle(
        &self,
        reply: &ReservationReply,
        guard: &str,
    ) -> Result<Idempotent<Settlement>, LedgerError> {
        self.transaction(|state| {
            if !state.processed.claim(guard) {
                return Ok(Idempotent::Duplicate);
            }

            let invoice_id = reply.invoice_id();
            let (updated, settlement) = apply_reply(state.tables.invoices.get(&invoice_id), reply)?;
            if let Some(updated) = updated {
                state.tables.invoices.insert(invoice_id, updated);
            }
            Ok(Idempotent::Applied(settlement))
        })
        .await
    }

    async fn invoice(&self, invoice_id: Uuid) -> Result<Option<InvoiceWithItems>, LedgerError> {
        self.read(|state| {
            state.tables.invoices.get(&invoice_id).map(|invoice| InvoiceWithItems {
                invoice: invoice.clone(),
                items: state.tables.items_of(invoice_id),
            })
        })
        .await
    }
}
