use bigdecimal::BigDecimal;
use shared::{
    Idempotent, InvalidTransition, InvoiceCancelled, InvoiceCreated, LedgerError, LineItem,
    ReservationConfirmed, ReservationFailed, SagaEvent, SagaState, SagaTransition,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ledger::BillingLedger;
use crate::models::{Invoice, InvoiceItem, InvoiceWithItems};

#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("invoice {0} not found")]
    NotFound(Uuid),

    #[error("invoice {invoice_id} is {state}, items can only be added while CREATED")]
    NotOpen { invoice_id: Uuid, state: SagaState },

    #[error("invoice {0} has no items")]
    NoItems(Uuid),

    #[error("invoice number {0} is already in use")]
    DuplicateNumber(String),

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i32),

    #[error("unit price must not be negative, got {0}")]
    InvalidPrice(BigDecimal),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<diesel::result::Error> for InvoiceError {
    fn from(e: diesel::result::Error) -> Self {
        InvoiceError::Ledger(LedgerError::Database(e))
    }
}

/// Stock's answer to a reservation request.
#[derive(Debug, Clone, PartialEq)]
pub enum ReservationReply {
    Confirmed(ReservationConfirmed),
    Failed(ReservationFailed),
}

impl ReservationReply {
    pub fn invoice_id(&self) -> Uuid {
        match self {
            ReservationReply::Confirmed(reply) => reply.invoice_id,
            ReservationReply::Failed(reply) => reply.invoice_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Confirmed,
    Compensated { reason: String },
    /// Unknown invoice, one no longer waiting for stock, or a confirmation
    /// that names no items.
    Ignored,
}

/// Where a reply takes an invoice currently in `current`. `None` means the
/// reply is stale and must not change anything.
pub fn settle_state(current: SagaState, reply: &ReservationReply) -> Option<SagaState> {
    let path: &[SagaTransition] = match reply {
        ReservationReply::Confirmed(_) => {
            &[SagaTransition::ReservationConfirmed, SagaTransition::Finalize]
        }
        ReservationReply::Failed(_) => {
            &[SagaTransition::ReservationFailed, SagaTransition::Compensate]
        }
    };

    path.iter()
        .try_fold(current, |state, transition| state.apply(*transition))
        .ok()
}

/// CREATED (or COMPENSATED, for a retry) to RESERVATION_REQUESTED, with the
/// event asking stock for the invoice lines.
pub(crate) fn start_saga(
    invoice: &Invoice,
    items: &[InvoiceItem],
) -> Result<(Invoice, SagaEvent), InvoiceError> {
    let next = invoice.state()?.apply(SagaTransition::RequestReservation)?;
    if items.is_empty() {
        return Err(InvoiceError::NoItems(invoice.id));
    }

    let event = SagaEvent::InvoiceCreated(InvoiceCreated {
        invoice_id: invoice.id,
        items: items
            .iter()
            .map(|item| LineItem::new(item.product_id, item.quantity))
            .collect(),
    });
    let mut updated = invoice.clone().moved_to(next);
    updated.failure_reason = None;
    Ok((updated, event))
}

pub(crate) fn cancel_saga(invoice: &Invoice) -> Result<(Invoice, SagaEvent), InvoiceError> {
    let next = invoice.state()?.apply(SagaTransition::Cancel)?;
    let event = SagaEvent::InvoiceCancelled(InvoiceCancelled {
        invoice_id: invoice.id,
    });
    Ok((invoice.clone().moved_to(next), event))
}

/// The invoice row a reply leaves behind, if it changes anything.
pub(crate) fn apply_reply(
    invoice: Option<&Invoice>,
    reply: &ReservationReply,
) -> Result<(Option<Invoice>, Settlement), LedgerError> {
    let Some(invoice) = invoice else {
        return Ok((None, Settlement::Ignored));
    };
    if matches!(reply, ReservationReply::Confirmed(c) if c.items.is_empty()) {
        return Ok((None, Settlement::Ignored));
    }

    let Some(next) = settle_state(invoice.state()?, reply) else {
        return Ok((None, Settlement::Ignored));
    };

    let mut updated = invoice.clone().moved_to(next);
    let settlement = match reply {
        ReservationReply::Confirmed(_) => Settlement::Confirmed,
        ReservationReply::Failed(failed) => {
            updated.failure_reason = Some(failed.reason.clone());
            Settlement::Compensated {
                reason: failed.reason.clone(),
            }
        }
    };
    Ok((Some(updated), settlement))
}

/// Invoice use cases of billing. Starting and cancelling the saga each commit
/// the state change and its outbox event together.
pub struct InvoiceService<L> {
    ledger: L,
}

impl<L: BillingLedger> InvoiceService<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }

    pub async fn create_invoice(&self, number: &str) -> Result<Invoice, InvoiceError> {
        let invoice = Invoice::new(number);
        self.ledger.insert_invoice(&invoice).await?;
        info!(invoice_id = %invoice.id, number, "Invoice created");
        Ok(invoice)
    }

    pub async fn add_item(
        &self,
        invoice_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        unit_price: BigDecimal,
    ) -> Result<InvoiceItem, InvoiceError> {
        if quantity <= 0 {
            return Err(InvoiceError::InvalidQuantity(quantity));
        }
        if unit_price < BigDecimal::from(0) {
            return Err(InvoiceError::InvalidPrice(unit_price));
        }

        let item = InvoiceItem::new(invoice_id, product_id, quantity, unit_price);
        self.ledger.add_item(&item).await?;
        Ok(item)
    }

    /// Starts the saga: CREATED to RESERVATION_REQUESTED plus a
    /// `NotaFiscalCriada` outbox row.
    pub async fn request_reservation(&self, invoice_id: Uuid) -> Result<Invoice, InvoiceError> {
        let invoice = self.ledger.request_reservation(invoice_id).await?;
        info!(invoice_id = %invoice_id, "Stock reservation requested");
        Ok(invoice)
    }

    /// CONFIRMED to CANCELLED plus a `NotaFiscalCancelada` outbox row so stock
    /// releases its reservations.
    pub async fn cancel_invoice(&self, invoice_id: Uuid) -> Result<Invoice, InvoiceError> {
        let invoice = self.ledger.cancel(invoice_id).await?;
        info!(invoice_id = %invoice_id, "Invoice cancelled");
        Ok(invoice)
    }

    pub async fn invoice(&self, invoice_id: Uuid) -> Result<InvoiceWithItems, InvoiceError> {
        self.ledger
            .invoice(invoice_id)
            .await?
            .ok_or(InvoiceError::NotFound(invoice_id))
    }

    /// Applies stock's reply, guarded by the processed-message marker.
    pub async fn settle(
        &self,
        reply: &ReservationReply,
        message_id: &str,
    ) -> Result<Idempotent<Settlement>, LedgerError> {
        let result = self.ledger.settle(reply, message_id).await?;

        if let Idempotent::Applied(settlement) = &result {
            let invoice_id = reply.invoice_id();
            match settlement {
                Settlement::Confirmed => info!(invoice_id = %invoice_id, "Invoice confirmed"),
                Settlement::Compensated { reason } => warn!(
                    invoice_id = %invoice_id,
                    reason = %reason,
                    "Reservation rejected, invoice left open for retry"
                ),
                Settlement::Ignored => info!(
                    invoice_id = %invoice_id,
                    "Reply does not settle the invoice, ignored"
                ),
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryBillingLedger;

    fn service() -> (InvoiceService<InMemoryBillingLedger>, InMemoryBillingLedger) {
        let ledger = InMemoryBillingLedger::new();
        (InvoiceService::new(ledger.clone()), ledger)
    }

    fn confirmed(invoice_id: Uuid) -> ReservationReply {
        ReservationReply::Confirmed(ReservationConfirmed {
            invoice_id,
            items: vec![LineItem::new(Uuid::new_v4(), 3)],
        })
    }

    fn failed(invoice_id: Uuid) -> ReservationReply {
        ReservationReply::Failed(ReservationFailed {
            invoice_id,
            reason: "insufficient stock".to_string(),
        })
    }

    async fn requested_invoice(
        service: &InvoiceService<InMemoryBillingLedger>,
    ) -> (Invoice, Uuid) {
        let invoice = service.create_invoice("NF-0001").await.unwrap();
        let product_id = Uuid::new_v4();
        service
            .add_item(invoice.id, product_id, 3, BigDecimal::from(10))
            .await
            .unwrap();
        let invoice = service.request_reservation(invoice.id).await.unwrap();
        (invoice, product_id)
    }

    #[test]
    fn replies_only_settle_invoices_awaiting_stock() {
        let id = Uuid::new_v4();
        assert_eq!(
            settle_state(SagaState::ReservationRequested, &confirmed(id)),
            Some(SagaState::Confirmed)
        );
        assert_eq!(
            settle_state(SagaState::ReservationRequested, &failed(id)),
            Some(SagaState::Compensated)
        );
        assert_eq!(settle_state(SagaState::Created, &confirmed(id)), None);
        assert_eq!(settle_state(SagaState::Confirmed, &failed(id)), None);
        assert_eq!(settle_state(SagaState::Compensated, &confirmed(id)), None);
    }

    #[tokio::test]
    async fn requesting_a_reservation_emits_the_invoice_lines() {
        let (service, ledger) = service();
        let (invoice, product_id) = requested_invoice(&service).await;

        assert_eq!(invoice.status, "RESERVATION_REQUESTED");

        let outbox = ledger.snapshot().await.outbox;
        let events = outbox.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "NotaFiscalCriada");
        assert_eq!(events[0].aggregate_id, invoice.id);
        let items: Vec<LineItem> =
            serde_json::from_value(events[0].payload["itens"].clone()).unwrap();
        assert_eq!(items, vec![LineItem::new(product_id, 3)]);
    }

    #[tokio::test]
    async fn an_invoice_without_items_cannot_start_the_saga() {
        let (service, ledger) = service();
        let invoice = service.create_invoice("NF-0002").await.unwrap();

        let err = service.request_reservation(invoice.id).await.unwrap_err();

        assert!(matches!(err, InvoiceError::NoItems(id) if id == invoice.id));
        assert!(ledger.snapshot().await.outbox.events().is_empty());
        assert_eq!(service.invoice(invoice.id).await.unwrap().invoice.status, "CREATED");
    }

    #[tokio::test]
    async fn items_are_only_accepted_while_created() {
        let (service, _) = service();
        let (invoice, _) = requested_invoice(&service).await;

        let err = service
            .add_item(invoice.id, Uuid::new_v4(), 1, BigDecimal::from(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvoiceError::NotOpen { state: SagaState::ReservationRequested, .. }
        ));

        let err = service
            .add_item(Uuid::new_v4(), Uuid::new_v4(), 1, BigDecimal::from(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InvoiceError::NotFound(_)));

        let err = service
            .add_item(invoice.id, Uuid::new_v4(), 0, BigDecimal::from(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InvoiceError::InvalidQuantity(0)));
    }

    #[tokio::test]
    async fn invoice_numbers_are_unique() {
        let (service, _) = service();
        service.create_invoice("NF-0003").await.unwrap();

        let err = service.create_invoice("NF-0003").await.unwrap_err();
        assert!(matches!(err, InvoiceError::DuplicateNumber(n) if n == "NF-0003"));
    }

    #[tokio::test]
    async fn confirmation_finalizes_the_invoice_once() {
        let (service, _) = service();
        let (invoice, _) = requested_invoice(&service).await;

        let first = service.settle(&confirmed(invoice.id), "r-1").await.unwrap();
        assert_eq!(first, Idempotent::Applied(Settlement::Confirmed));

        let replay = service.settle(&confirmed(invoice.id), "r-1").await.unwrap();
        assert!(replay.is_duplicate());

        let stored = service.invoice(invoice.id).await.unwrap();
        assert_eq!(stored.invoice.status, "CONFIRMED");
        assert_eq!(stored.total(), BigDecimal::from(30));
    }

    #[tokio::test]
    async fn rejection_compensates_and_keeps_the_reason() {
        let (service, _) = service();
        let (invoice, _) = requested_invoice(&service).await;

        let settled = service.settle(&failed(invoice.id), "r-2").await.unwrap();
        assert_eq!(
            settled,
            Idempotent::Applied(Settlement::Compensated {
                reason: "insufficient stock".to_string()
            })
        );

        let stored = service.invoice(invoice.id).await.unwrap().invoice;
        assert_eq!(stored.status, "COMPENSATED");
        assert_eq!(stored.failure_reason.as_deref(), Some("insufficient stock"));

        let late = service.settle(&confirmed(invoice.id), "r-3").await.unwrap();
        assert_eq!(late, Idempotent::Applied(Settlement::Ignored));
        assert_eq!(service.invoice(invoice.id).await.unwrap().invoice.status, "COMPENSATED");
    }

    #[tokio::test]
    async fn a_rejected_invoice_can_request_stock_again() {
        let (service, ledger) = service();
        let (invoice, product_id) = requested_invoice(&service).await;
        service.settle(&failed(invoice.id), "r-6").await.unwrap();

        let retried = service.request_reservation(invoice.id).await.unwrap();
        assert_eq!(retried.status, "RESERVATION_REQUESTED");
        assert_eq!(retried.failure_reason, None);

        let snapshot = ledger.snapshot().await;
        let events = snapshot.outbox.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == "NotaFiscalCriada"));
        assert_ne!(events[0].id, events[1].id);
        let items: Vec<LineItem> =
            serde_json::from_value(events[1].payload["itens"].clone()).unwrap();
        assert_eq!(items, vec![LineItem::new(product_id, 3)]);

        let settled = service.settle(&confirmed(invoice.id), "r-7").await.unwrap();
        assert_eq!(settled, Idempotent::Applied(Settlement::Confirmed));
    }

    #[tokio::test]
    async fn a_confirmation_without_items_is_ignored() {
        let (service, ledger) = service();
        let (invoice, _) = requested_invoice(&service).await;
        let empty = ReservationReply::Confirmed(ReservationConfirmed {
            invoice_id: invoice.id,
            items: vec![],
        });

        let settled = service.settle(&empty, "r-8").await.unwrap();

        assert_eq!(settled, Idempotent::Applied(Settlement::Ignored));
        assert!(ledger.snapshot().await.processed.contains("r-8"));
        let stored = service.invoice(invoice.id).await.unwrap().invoice;
        assert_eq!(stored.status, "RESERVATION_REQUESTED");
    }

    #[tokio::test]
    async fn replies_for_unknown_invoices_are_marked_and_ignored() {
        let (service, ledger) = service();

        let settled = service.settle(&confirmed(Uuid::new_v4()), "r-4").await.unwrap();

        assert_eq!(settled, Idempotent::Applied(Settlement::Ignored));
        assert!(ledger.snapshot().await.processed.contains("r-4"));
    }

    #[tokio::test]
    async fn only_confirmed_invoices_can_be_cancelled() {
        let (service, ledger) = service();
        let (invoice, _) = requested_invoice(&service).await;

        let err = service.cancel_invoice(invoice.id).await.unwrap_err();
        assert!(matches!(err, InvoiceError::InvalidTransition(_)));

        service.settle(&confirmed(invoice.id), "r-5").await.unwrap();
        let cancelled = service.cancel_invoice(invoice.id).await.unwrap();
        assert_eq!(cancelled.status, "CANCELLED");

        let snapshot = ledger.snapshot().await;
        let last = snapshot.outbox.events().last().unwrap();
        assert_eq!(last.event_type, "NotaFiscalCancelada");
        assert_eq!(last.aggregate_id, invoice.id);
    }
}
