//! Storage behind the reservation use case.
//!
//! Each method is one local transaction. Methods taking a `guard` insert the
//! processed-message marker for it in that same transaction and return
//! `Idempotent::Duplicate` without touching anything else when it already
//! exists.

mod memory;
mod postgres;

pub use memory::{InMemoryStockLedger, StockTables};
pub use postgres::PgStockLedger;

use async_trait::async_trait;
use shared::{Idempotent, LedgerError};
use uuid::Uuid;

use crate::models::{Product, Reservation};
use crate::reservation::{ReservationOutcome, ReservationRequest};

#[async_trait]
pub trait StockLedger: Send + Sync {
    /// `false` when the SKU is already taken.
    async fn insert_product(&self, product: &Product) -> Result<bool, LedgerError>;

    async fn product(&self, product_id: Uuid) -> Result<Option<Product>, LedgerError>;

    /// Locks the requested products, decides the reservation, applies it and
    /// appends the matching outbox event. Rejections commit too.
    async fn reserve(
        &self,
        request: &ReservationRequest,
        guard: Option<&str>,
    ) -> Result<Idempotent<ReservationOutcome>, LedgerError>;

    /// Cancels the invoice's RESERVED reservations and restores balances.
    async fn release(
        &self,
        invoice_id: Uuid,
        guard: Option<&str>,
    ) -> Result<Idempotent<Vec<Reservation>>, LedgerError>;

    async fn reservations_for(&self, invoice_id: Uuid) -> Result<Vec<Reservation>, LedgerError>;
}
