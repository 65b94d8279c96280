use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::postgres::{claim_message, insert_outbox_event, DbPool};
use shared::{Idempotent, LedgerError, NewOutboxEvent, SagaState};
use uuid::Uuid;

use super::BillingLedger;
use crate::invoices::{
    apply_reply, cancel_saga, start_saga, InvoiceError, ReservationReply, Settlement,
};
use crate::models::{Invoice, InvoiceItem, InvoiceWithItems};
use crate::schema::{invoice_items, invoices};

#[derive(Clone)]
pub struct PgBillingLedger {
    pool: DbPool,
}

impl PgBillingLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

async fn lock_invoice(
    conn: &mut AsyncPgConnection,
    invoice_id: Uuid,
) -> Result<Option<Invoice>, diesel::result::Error> {
    invoices::table
        .find(invoice_id)
        .for_update()
        .first::<Invoice>(conn)
        .await
        .optional()
}

async fn save_invoice(
    conn: &mut AsyncPgConnection,
    invoice: &Invoice,
) -> Result<(), diesel::result::Error> {
    diesel::update(invoices::table.find(invoice.id))
        .set((
            invoices::status.eq(&invoice.status),
            invoices::failure_reason.eq(&invoice.failure_reason),
            invoices::updated_at.eq(invoice.updated_at),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

async fn items_of(
    conn: &mut AsyncPgConnection,
    invoice_id: Uuid,
) -> Result<Vec<InvoiceItem>, diesel::result::Error> {
    invoice_items::table
        .filter(invoice_items::invoice_id.eq(invoice_id))
        .order(invoice_items::created_at.asc())
        .load::<InvoiceItem>(conn)
        .await
}

#[async_trait]
impl BillingLedger for PgBillingLedger {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), InvoiceError> {
        let mut conn = self.pool.get().await.map_err(LedgerError::from)?;

        let inserted = diesel::insert_into(invoices::table)
            .values(invoice)
            .on_conflict(invoices::number)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        if inserted == 0 {
            return Err(InvoiceError::DuplicateNumber(invoice.number.clone()));
        }
        Ok(())
    }

    async fn add_item(&self, item: &InvoiceItem) -> Result<(), InvoiceError> {
        let mut conn = self.pool.get().await.map_err(LedgerError::from)?;
        let item = item.clone();

        conn.transaction::<_, InvoiceError, _>(|conn| {
            Box::pin(async move {
                let invoice = lock_invoice(conn, item.invoice_id)
                    .await?
                    .ok_or(InvoiceError::NotFound(item.invoice_id))?;
                let current = invoice.state()?;
                if current != SagaState::Created {
                    return Err(InvoiceError::NotOpen {
                        invoice_id: invoice.id,
                        state: current,
                    });
                }

                diesel::insert_into(invoice_items::table)
                    .values(&item)
                    .execute(conn)
                    .await?;

                diesel::update(invoices::table.find(invoice.id))
                    .set(invoices::updated_at.eq(Utc::now()))
                    .execute(conn)
                    .await?;

                Ok(())
            })
        })
        .await
    }

    async fn request_reservation(&self, invoice_id: Uuid) -> Result<Invoice, InvoiceError> {
        let mut conn = self.pool.get().await.map_err(LedgerError::from)?;

        conn.transaction::<_, InvoiceError, _>(|conn| {
            Box::pin(async move {
                let invoice = lock_invoice(conn, invoice_id)
                    .await?
                    .ok_or(InvoiceError::NotFound(invoice_id))?;
                let items = items_of(conn, invoice_id).await?;
                let (updated, event) = start_saga(&invoice, &items)?;

                save_invoice(conn, &updated).await?;
                let event = NewOutboxEvent::from_event(&event).map_err(LedgerError::from)?;
                insert_outbox_event(conn, &event).await?;

                Ok(updated)
            })
        })
        .await
    }

    async fn cancel(&self, invoice_id: Uuid) -> Result<Invoice, InvoiceError> {
        let mut conn = self.pool.get().await.map_err(LedgerError::from)?;

        conn.transaction::<_, InvoiceError, _>(|conn| {
            Box::pin(async move {
                let invoice = lock_invoice(conn, invoice_id)
                    .await?
                    .ok_or(InvoiceError::NotFound(invoice_id))?;
                let (updated, event) = cancel_saga(&invoice)?;

                save_invoice(conn, &updated).await?;
                let event = NewOutboxEvent::from_event(&event).map_err(LedgerError::from)?;
                insert_outbox_event(conn, &event).await?;

                Ok(updated)
            })
        })
        .await
    }

    async fn settle(
        &self,
        reply: &ReservationReply,
        guard: &str,
    ) -> Result<Idempotent<Settlement>, LedgerError> {
        let mut conn = self.pool.get().await?;
        let reply = reply.clone();
        let guard = guard.to_string();

        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move {
                if !claim_message(conn, &guard).await? {
                    return Ok(Idempotent::Duplicate);
                }

                let invoice = lock_invoice(conn, reply.invoice_id()).await?;
                let (updated, settlement) = apply_reply(invoice.as_ref(), &reply)?;
                if let Some(updated) = updated {
                    save_invoice(conn, &updated).await?;
                }

                Ok(Idempotent::Applied(settlement))
            })
        })
        .await
    }

    async fn invoice(&self, invoice_id: Uuid) -> Result<Option<InvoiceWithItems>, LedgerError> {
        let mut conn = self.pool.get().await?;

        let invoice = invoices::table
            .find(invoice_id)
            .first::<Invoice>(&mut conn)
            .await
            .optional()?;

        let Some(invoice) = invoice else {
            return Ok(None);
        };

        let items = items_of(&mut conn, invoice_id).await?;
        Ok(Some(InvoiceWithItems { invoice, items }))
    }
}
