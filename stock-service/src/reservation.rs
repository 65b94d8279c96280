use shared::{Idempotent, LedgerError, LineItem, ReservationConfirmed, ReservationFailed, SagaEvent};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ledger::StockLedger;
use crate::models::{Product, Reservation};

/// Business outcome of a reservation that could not be granted. The
/// `Display` form is the `motivo` carried by `ReservaFalhou`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    InsufficientStock,
    SimulatedFailure,
    ProductNotFound,
    ProductInactive,
    InvalidQuantity,
    NoLineItems,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::InsufficientStock => "insufficient stock",
            RejectionReason::SimulatedFailure => "simulated failure",
            RejectionReason::ProductNotFound => "product not found",
            RejectionReason::ProductInactive => "product inactive",
            RejectionReason::InvalidQuantity => "invalid quantity",
            RejectionReason::NoLineItems => "no line items",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReservationRequest {
    pub invoice_id: Uuid,
    pub items: Vec<LineItem>,
    pub simulate_failure: bool,
}

impl ReservationRequest {
    pub fn new(invoice_id: Uuid, items: Vec<LineItem>) -> Self {
        Self {
            invoice_id,
            items,
            simulate_failure: false,
        }
    }

    pub fn single(
        invoice_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        simulate_failure: bool,
    ) -> Self {
        Self {
            invoice_id,
            items: vec![LineItem::new(product_id, quantity)],
            simulate_failure,
        }
    }

    /// Requested quantity per product, repeated lines summed, in product id
    /// order. That order is also the row locking order.
    pub fn demand(&self) -> BTreeMap<Uuid, i64> {
        let mut demand = BTreeMap::new();
        for item in &self.items {
            *demand.entry(item.product_id).or_insert(0) += i64::from(item.quantity);
        }
        demand
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReservationOutcome {
    Reserved(Vec<Reservation>),
    Rejected(RejectionReason),
}

impl ReservationOutcome {
    pub fn is_reserved(&self) -> bool {
        matches!(self, ReservationOutcome::Reserved(_))
    }

    /// The event announcing this outcome to billing.
    pub fn event(&self, invoice_id: Uuid) -> SagaEvent {
        match self {
            ReservationOutcome::Reserved(reservations) => {
                SagaEvent::ReservationConfirmed(ReservationConfirmed {
                    invoice_id,
                    items: reservations
                        .iter()
                        .map(|r| LineItem::new(r.product_id, r.quantity))
                        .collect(),
                })
            }
            ReservationOutcome::Rejected(reason) => SagaEvent::ReservationFailed(ReservationFailed {
                invoice_id,
                reason: reason.to_string(),
            }),
        }
    }
}

/// Decides a reservation against the locked rows of the requested products.
///
/// Returns the quantity to take from each product, in product id order, or
/// the first reason the request cannot be granted. Nothing is granted unless
/// every line can be.
pub fn plan_reservation(
    request: &ReservationRequest,
    products: &BTreeMap<Uuid, Product>,
) -> Result<Vec<(Uuid, i32)>, RejectionReason> {
    if request.items.is_empty() {
        return Err(RejectionReason::NoLineItems);
    }
    if request.items.iter().any(|item| item.quantity <= 0) {
        return Err(RejectionReason::InvalidQuantity);
    }

    let demand = request.demand();

    for product_id in demand.keys() {
        match products.get(product_id) {
            None => return Err(RejectionReason::ProductNotFound),
            Some(product) if !product.active => return Err(RejectionReason::ProductInactive),
            Some(_) => {}
        }
    }

    if request.simulate_failure {
        return Err(RejectionReason::SimulatedFailure);
    }

    let mut plan = Vec::with_capacity(demand.len());
    for (product_id, wanted) in demand {
        let product = products.get(&product_id).ok_or(RejectionReason::ProductNotFound)?;
        if i64::from(product.balance) < wanted {
            return Err(RejectionReason::InsufficientStock);
        }
        let quantity = i32::try_from(wanted).map_err(|_| RejectionReason::InsufficientStock)?;
        plan.push((product_id, quantity));
    }

    Ok(plan)
}

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i32),

    #[error("balance must not be negative, got {0}")]
    NegativeBalance(i32),

    #[error("sku {0} is already registered")]
    DuplicateSku(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ReservationError {
    /// Only infrastructure faults are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReservationError::Ledger(_))
    }
}

/// The stock reservation use case. Every call is one ledger transaction and
/// the outbox row is its only externally visible effect.
pub struct ReservationService<L> {
    ledger: L,
}

impl<L: StockLedger> ReservationService<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }

    pub async fn register_product(
        &self,
        sku: &str,
        name: &str,
        balance: i32,
    ) -> Result<Product, ReservationError> {
        if balance < 0 {
            return Err(ReservationError::NegativeBalance(balance));
        }

        let product = Product::new(sku, name, balance);
        if !self.ledger.insert_product(&product).await? {
            return Err(ReservationError::DuplicateSku(sku.to_string()));
        }

        info!(product_id = %product.id, sku, balance, "Product registered");
        Ok(product)
    }

    pub async fn product(&self, product_id: Uuid) -> Result<Option<Product>, ReservationError> {
        Ok(self.ledger.product(product_id).await?)
    }

    /// Reserves `quantity` units of one product for an invoice.
    ///
    /// Insufficient stock and simulated failures come back as
    /// `Ok(ReservationOutcome::Rejected)` with a committed `ReservaFalhou`
    /// outbox row. A non-positive quantity is refused before any transaction
    /// starts.
    pub async fn reserve(
        &self,
        invoice_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        simulate_failure: bool,
    ) -> Result<ReservationOutcome, ReservationError> {
        if quantity <= 0 {
            return Err(ReservationError::InvalidQuantity(quantity));
        }

        let request =
            ReservationRequest::single(invoice_id, product_id, quantity, simulate_failure);
        match self.ledger.reserve(&request, None).await? {
            Idempotent::Applied(outcome) => {
                log_outcome(&request, &outcome);
                Ok(outcome)
            }
            Idempotent::Duplicate => Err(LedgerError::Corrupt(
                "unguarded reservation reported as duplicate".to_string(),
            )
            .into()),
        }
    }

    /// Reserves every line of an invoice in one transaction, guarded by the
    /// processed-message marker for `message_id`.
    pub async fn reserve_for_invoice(
        &self,
        request: &ReservationRequest,
        message_id: &str,
    ) -> Result<Idempotent<ReservationOutcome>, LedgerError> {
        let result = self.ledger.reserve(request, Some(message_id)).await?;
        if let Idempotent::Applied(outcome) = &result {
            log_outcome(request, outcome);
        }
        Ok(result)
    }

    /// Cancels every RESERVED reservation of an invoice and gives the stock
    /// back.
    pub async fn release(
        &self,
        invoice_id: Uuid,
        message_id: Option<&str>,
    ) -> Result<Idempotent<Vec<Reservation>>, LedgerError> {
        let result = self.ledger.release(invoice_id, message_id).await?;
        if let Idempotent::Applied(released) = &result {
            info!(invoice_id = %invoice_id, released = released.len(), "Reservations released");
        }
        Ok(result)
    }

    pub async fn reservations_for(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<Reservation>, LedgerError> {
        self.ledger.reservations_for(invoice_id).await
    }
}

fn log_outcome(request: &ReservationRequest, outcome: &ReservationOutcome) {
    match outcome {
        ReservationOutcome::Reserved(reservations) => info!(
            invoice_id = %request.invoice_id,
            lines = reservations.len(),
            "Stock reserved"
        ),
        ReservationOutcome::Rejected(reason) => warn!(
            invoice_id = %request.invoice_id,
            reason = %reason,
            "Reservation rejected"
        ),
    }
}
