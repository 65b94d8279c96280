use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use shared::postgres::{claim_message, insert_outbox_event, DbPool};
use shared::{Idempotent, LedgerError, NewOutboxEvent};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::StockLedger;
use crate::models::{Product, Reservation, ReservationStatus};
use crate::reservation::{plan_reservation, ReservationOutcome, ReservationRequest};
use crate::schema::{products, reservations};

#[derive(Clone)]
pub struct PgStockLedger {
    pool: DbPool,
}

impl PgStockLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StockLedger for PgStockLedger {
    async fn insert_product(&self, product: &Product) -> Result<bool, LedgerError> {
        let mut conn = self.pool.get().await?;

        let inserted = diesel::insert_into(products::table)
            .values(product)
            .on_conflict(products::sku)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(inserted == 1)
    }

    async fn product(&self, product_id: Uuid) -> Result<Option<Product>, LedgerError> {
        let mut conn = self.pool.get().await?;

        let product = products::table
            .find(product_id)
            .first::<Product>(&mut conn)
            .await
            .optional()?;

        Ok(product)
    }

    async fn reserve(
        &self,
        request: &ReservationRequest,
        guard: Option<&str>,
    ) -> Result<Idempotent<ReservationOutcome>, LedgerError> {
        let mut conn = self.pool.get().await?;
        let request = request.clone();
        let guard = guard.map(str::to_string);

        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move {
                if let Some(message_id) = guard.as_deref() {
                    if !claim_message(conn, message_id).await? {
                        return Ok(Idempotent::Duplicate);
                    }
                }

                // Rows are locked in id order so concurrent multi-line
                // reservations cannot deadlock.
                let ids: Vec<Uuid> = request.demand().into_keys().collect();
                let locked: BTreeMap<Uuid, Product> = products::table
                    .filter(products::id.eq_any(ids))
                    .order(products::id.asc())
                    .for_update()
                    .load::<Product>(conn)
                    .await?
                    .into_iter()
                    .map(|p| (p.id, p))
                    .collect();

                let outcome = match plan_reservation(&request, &locked) {
                    Ok(plan) => {
                        let mut reserved = Vec::with_capacity(plan.len());
                        for (product_id, quantity) in plan {
                            diesel::update(products::table.find(product_id))
                                .set(products::balance.eq(products::balance - quantity))
                                .execute(conn)
                                .await?;
                            reserved.push(Reservation::reserved(
                                request.invoice_id,
                                product_id,
                                quantity,
                            ));
                        }

                        diesel::insert_into(reservations::table)
                            .values(&reserved)
                            .execute(conn)
                            .await?;

                        ReservationOutcome::Reserved(reserved)
                    }
                    Err(reason) => ReservationOutcome::Rejected(reason),
                };

                let event = NewOutboxEvent::from_event(&outcome.event(request.invoice_id))?;
                insert_outbox_event(conn, &event).await?;

                Ok(Idempotent::Applied(outcome))
            })
        })
        .await
    }

    async fn release(
        &self,
        invoice_id: Uuid,
        guard: Option<&str>,
    ) -> Result<Idempotent<Vec<Reservation>>, LedgerError> {
        let mut conn = self.pool.get().await?;
        let guard = guard.map(str::to_string);

        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move {
                if let Some(message_id) = guard.as_deref() {
                    if !claim_message(conn, message_id).await? {
                        return Ok(Idempotent::Duplicate);
                    }
                }

                let held = reservations::table
                    .filter(reservations::invoice_id.eq(invoice_id))
                    .filter(reservations::status.eq(ReservationStatus::Reserved.as_str()))
                    .order(reservations::product_id.asc())
                    .for_update()
                    .load::<Reservation>(conn)
                    .await?;

                for reservation in &held {
                    diesel::update(products::table.find(reservation.product_id))
                        .set(products::balance.eq(products::balance + reservation.quantity))
                        .execute(conn)
                        .await?;
                }

                let ids: Vec<Uuid> = held.iter().map(|r| r.id).collect();
                diesel::update(reservations::table.filter(reservations::id.eq_any(ids)))
                    .set(reservations::status.eq(ReservationStatus::Cancelled.as_str()))
                    .execute(conn)
                    .await?;

                Ok(Idempotent::Applied(held.into_iter().map(Reservation::cancelled).collect()))
            })
        })
        .await
    }

    async fn reservations_for(&self, invoice_id: Uuid) -> Result<Vec<Reservation>, LedgerError> {
        let mut conn = self.pool.get().await?;

        let rows = reservations::table
            .filter(reservations::invoice_id.eq(invoice_id))
            .order(reservations::created_at.asc())
            .load::<Reservation>(&mut conn)
            .await?;

        Ok(rows)
    }
}
