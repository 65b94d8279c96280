use async_trait::async_trait;
use shared::{Disposition, EventHandler, Idempotent, LedgerError, SagaEvent};
use tracing::warn;

use crate::invoices::{InvoiceService, ReservationReply, Settlement};
use crate::ledger::BillingLedger;

/// Billing's side of the saga: finalizes or compensates invoices when stock
/// answers a reservation request.
pub struct BillingEventHandler<L> {
    invoices: InvoiceService<L>,
}

impl<L: BillingLedger> BillingEventHandler<L> {
    pub fn new(invoices: InvoiceService<L>) -> Self {
        Self { invoices }
    }
}

#[async_trait]
impl<L: BillingLedger> EventHandler for BillingEventHandler<L> {
    async fn handle(&self, message_id: &str, event: SagaEvent) -> Result<Disposition, LedgerError> {
        let reply = match event {
            SagaEvent::ReservationConfirmed(confirmed) => ReservationReply::Confirmed(confirmed),
            SagaEvent::ReservationFailed(failed) => ReservationReply::Failed(failed),
            other => {
                warn!(
                    event_type = %other.event_type(),
                    invoice_id = %other.invoice_id(),
                    "Event not handled by billing, ignoring"
                );
                return Ok(Disposition::Ignored);
            }
        };

        let disposition = match self.invoices.settle(&reply, message_id).await? {
            Idempotent::Duplicate => Disposition::Duplicate,
            Idempotent::Applied(Settlement::Ignored) => Disposition::Ignored,
            Idempotent::Applied(_) => Disposition::Applied,
        };
        Ok(disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryBillingLedger;
    use bigdecimal::BigDecimal;
    use shared::{ConsumerConfig, EventConsumer, InboundMessage, ReservationFailed};
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn a_rejection_delivered_twice_compensates_once() {
        let ledger = InMemoryBillingLedger::new();
        let invoices = InvoiceService::new(ledger.clone());
        let invoice = invoices.create_invoice("NF-0100").await.unwrap();
        invoices
            .add_item(invoice.id, Uuid::new_v4(), 2, BigDecimal::from(5))
            .await
            .unwrap();
        invoices.request_reservation(invoice.id).await.unwrap();

        let consumer = EventConsumer::new(
            BillingEventHandler::new(InvoiceService::new(ledger.clone())),
            ConsumerConfig {
                max_attempts: 2,
                retry_delay: Duration::from_millis(1),
            },
        );
        let event = SagaEvent::ReservationFailed(ReservationFailed {
            invoice_id: invoice.id,
            reason: "product inactive".to_string(),
        });
        let message = InboundMessage {
            topic: "stock-events".to_string(),
            delivery_tag: "0:9".to_string(),
            message_id: Some("42".to_string()),
            event_type: Some("ReservaFalhou".to_string()),
            payload: serde_json::to_vec(&event.to_payload().unwrap()).unwrap(),
        };

        assert_eq!(consumer.process(&message).await.unwrap(), Disposition::Applied);
        assert_eq!(consumer.process(&message).await.unwrap(), Disposition::Duplicate);

        let stored = invoices.invoice(invoice.id).await.unwrap().invoice;
        assert_eq!(stored.status, "COMPENSATED");
        assert_eq!(stored.failure_reason.as_deref(), Some("product inactive"));
        assert_eq!(ledger.snapshot().await.processed.len(), 1);
    }
}
