use async_trait::async_trait;
use shared::{Disposition, EventHandler, Idempotent, LedgerError, SagaEvent};
use tracing::{info, warn};

use crate::ledger::StockLedger;
use crate::reservation::{ReservationRequest, ReservationService};

/// Stock's side of the saga: reserves on `NotaFiscalCriada` and gives the
/// stock back on `NotaFiscalCancelada`.
pub struct StockEventHandler<L> {
    reservations: ReservationService<L>,
}

impl<L: StockLedger> StockEventHandler<L> {
    pub fn new(reservations: ReservationService<L>) -> Self {
        Self { reservations }
    }
}

#[async_trait]
impl<L: StockLedger> EventHandler for StockEventHandler<L> {
    async fn handle(&self, message_id: &str, event: SagaEvent) -> Result<Disposition, LedgerError> {
        match event {
            SagaEvent::InvoiceCreated(created) => {
                info!(
                    invoice_id = %created.invoice_id,
                    lines = created.items.len(),
                    "Reserving stock for invoice"
                );
                let request = ReservationRequest::new(created.invoice_id, created.items);
                match self.reservations.reserve_for_invoice(&request, message_id).await? {
                    Idempotent::Applied(_) => Ok(Disposition::Applied),
                    Idempotent::Duplicate => Ok(Disposition::Duplicate),
                }
            }
            SagaEvent::InvoiceCancelled(cancelled) => {
                match self.reservations.release(cancelled.invoice_id, Some(message_id)).await? {
                    Idempotent::Applied(released) if released.is_empty() => {
                        info!(invoice_id = %cancelled.invoice_id, "No reservations to release");
                        Ok(Disposition::Ignored)
                    }
                    Idempotent::Applied(_) => Ok(Disposition::Applied),
                    Idempotent::Duplicate => Ok(Disposition::Duplicate),
                }
            }
            other => {
                warn!(
                    event_type = %other.event_type(),
                    invoice_id = %other.invoice_id(),
                    "Event not handled by stock, ignoring"
                );
                Ok(Disposition::Ignored)
            }
        }
    }
}
