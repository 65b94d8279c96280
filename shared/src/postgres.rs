use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

use crate::error::LedgerError;
use crate::outbox::{DeliveryRecord, NewOutboxEvent, OutboxEvent, OutboxStore};
use crate::schema::{outbox_events, processed_messages};

pub type DbPool = Pool<AsyncPgConnection>;

pub async fn build_pool(database_url: &str, max_size: u32) -> Result<DbPool, LedgerError> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    Pool::builder()
        .max_size(max_size)
        .build(config)
        .await
        .map_err(|e| LedgerError::Pool(e.to_string()))
}

/// Appends an event to the outbox inside the caller's transaction.
pub async fn insert_outbox_event(
    conn: &mut AsyncPgConnection,
    event: &NewOutboxEvent,
) -> Result<OutboxEvent, diesel::result::Error> {
    diesel::insert_into(outbox_events::table)
        .values(event)
        .get_result::<OutboxEvent>(conn)
        .await
}

/// Inserts the processed-message marker inside the caller's transaction.
///
/// Returns `false` when the marker already exists. The primary key makes a
/// concurrent duplicate wait for the first transaction and then insert
/// nothing, so two instances can never both apply the same message.
pub async fn claim_message(
    conn: &mut AsyncPgConnection,
    message_id: &str,
) -> Result<bool, diesel::result::Error> {
    let inserted = diesel::insert_into(processed_messages::table)
        .values((
            processed_messages::message_id.eq(message_id),
            processed_messages::processed_at.eq(Utc::now()),
        ))
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;

    Ok(inserted == 1)
}

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: DbPool,
}

impl PgOutboxStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn pending_events(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<OutboxEvent>, LedgerError> {
        let mut conn = self.pool.get().await?;

        let events = outbox_events::table
            .filter(outbox_events::published_at.is_null())
            .filter(outbox_events::attempts.lt(max_attempts))
            .order((outbox_events::occurred_at.asc(), outbox_events::id.asc()))
            .limit(limit)
            .load::<OutboxEvent>(&mut conn)
            .await?;

        Ok(events)
    }

    async fn record_deliveries(&self, deliveries: &[DeliveryRecord]) -> Result<(), LedgerError> {
        let mut conn = self.pool.get().await?;
        let deliveries = deliveries.to_vec();

        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move {
                for delivery in deliveries {
                    let target =
                        outbox_events::table.filter(outbox_events::id.eq(delivery.event_id));
                    match delivery.published_at {
                        Some(published_at) => {
                            diesel::update(target)
                                .set((
                                    outbox_events::published_at.eq(Some(published_at)),
                                    outbox_events::attempts.eq(outbox_events::attempts + 1),
                                ))
                                .execute(conn)
                                .await?;
                        }
                        None => {
                            diesel::update(target)
                                .set(outbox_events::attempts.eq(outbox_events::attempts + 1))
                                .execute(conn)
                                .await?;
                        }
                    }
                }
                Ok(())
            })
        })
        .await
    }

    async fn stuck_events(&self, max_attempts: i32) -> Result<Vec<OutboxEvent>, LedgerError> {
        let mut conn = self.pool.get().await?;

        let events = outbox_events::table
            .filter(outbox_events::published_at.is_null())
            .filter(outbox_events::attempts.ge(max_attempts))
            .order(outbox_events::occurred_at.asc())
            .load::<OutboxEvent>(&mut conn)
            .await?;

        Ok(events)
    }
}
