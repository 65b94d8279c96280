use async_trait::async_trait;
use shared::{Idempotent, LedgerError, MemoryLedger, NewOutboxEvent};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::StockLedger;
use crate::models::{Product, Reservation};
use crate::reservation::{plan_reservation, ReservationOutcome, ReservationRequest};

#[derive(Debug, Clone, Default)]
pub struct StockTables {
    pub products: BTreeMap<Uuid, Product>,
    pub reservations: Vec<Reservation>,
}

pub type InMemoryStockLedger = MemoryLedger<StockTables>;

#[async_trait]
impl StockLedger for MemoryLedger<StockTables> {
    async fn insert_product(&self, product: &Product) -> Result<bool, LedgerError> {
        self.transaction(|state| {
            if state.tables.products.values().any(|p| p.sku == product.sku) {
                return Ok(false);
            }
            state.tables.products.insert(product.id, product.clone());
            Ok(true)
        })
        .await
    }

    async fn product(&self, product_id: Uuid) -> Result<Option<Product>, LedgerError> {
        self.read(|state| state.tables.products.get(&product_id).cloned()).await
    }

    async fn reserve(
        &self,
        request: &ReservationRequest,
        guard: Option<&str>,
    ) -> Result<Idempotent<ReservationOutcome>, LedgerError> {
        self.transaction(|state| {
            if let Some(message_id) = guard {
                if !state.processed.claim(message_id) {
                    return Ok(Idempotent::Duplicate);
                }
            }

            let locked: BTreeMap<Uuid, Product> = request
                .demand()
                .keys()
                .filter_map(|id| state.tables.products.get(id).map(|p| (*id, p.clone())))
                .collect();

            let outcome = match plan_reservation(request, &locked) {
                Ok(plan) => {
                    let mut reserved = Vec::with_capacity(plan.len());
                    for (product_id, quantity) in plan {
                        let product = state
                            .tables
                            .products
                            .get_mut(&product_id)
                            .ok_or_else(|| {
                                LedgerError::Corrupt(format!("product {} vanished", product_id))
                            })?;
                        product.balance -= quantity;
                        let reservation =
                            Reservation::reserved(request.invoice_id, product_id, quantity);
                        reserved.push(reservation);
                    }
                    state.tables.reservations.extend(reserved.iter().cloned());
                    ReservationOutcome::Reserved(reserved)
                }
                Err(reason) => ReservationOutcome::Rejected(reason),
            };

            state
                .outbox
                .insert(NewOutboxEvent::from_event(&outcome.event(request.invoice_id))?);

            Ok(Idempotent::Applied(outcome))
        })
        .await
    }

    async fn release(
        &self,
        invoice_id: Uuid,
        guard: Option<&str>,
    ) -> Result<Idempotent<Vec<Reservation>>, LedgerError> {
        self.transaction(|state| {
            if let Some(message_id) = guard {
                if !state.processed.claim(message_id) {
                    return Ok(Idempotent::Duplicate);
                }
            }

            let mut released = Vec::new();
            for reservation in state
                .tables
                .reservations
                .iter_mut()
                .filter(|r| r.invoice_id == invoice_id && r.is_reserved())
            {
                let product = state
                    .tables
                    .products
                    .get_mut(&reservation.product_id)
                    .ok_or_else(|| {
                        LedgerError::Corrupt(format!("product {} vanished", reservation.product_id))
                    })?;
                product.balance += reservation.quantity;
                *reservation = reservation.clone().cancelled();
                released.push(reservation.clone());
            }

            Ok(Idempotent::Applied(released))
        })
        .await
    }

    async fn reservations_for(&self, invoice_id: Uuid) -> Result<Vec<Reservation>, LedgerError> {
        self.read(|state| {
            state
                .tables
                .reservations
                .iter()
                .filter(|r| r.invoice_id == invoice_id)
                .cloned()
                .collect()
        })
        .await
    }
}
