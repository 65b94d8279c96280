use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{MessageBus, OutboundMessage};
use crate::error::{BusError, LedgerError};
use crate::events::{topic_for, SagaEvent};

/// A committed business fact waiting to be relayed to the broker.
///
/// `published_at == None` means pending. Once `attempts` reaches the
/// publisher's ceiling without a successful publish the event is stuck and
/// only an operator can move it forward.
#[derive(Debug, Clone, PartialEq, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct OutboxEvent {
    pub id: i64,
    pub event_type: String,
    pub aggregate_id: Uuid,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub attempts: i32,
}

impl OutboxEvent {
    pub fn is_pending(&self) -> bool {
        self.published_at.is_none()
    }

    pub fn is_stuck(&self, max_attempts: i32) -> bool {
        self.is_pending() && self.attempts >= max_attempts
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub aggregate_id: Uuid,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl NewOutboxEvent {
    pub fn from_event(event: &SagaEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type: event.event_type().as_str().to_string(),
            aggregate_id: event.invoice_id(),
            payload: event.to_payload()?,
            occurred_at: Utc::now(),
        })
    }
}

/// Result of one publish attempt. Every record bumps `attempts`; only a
/// successful one sets `published_at`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryRecord {
    pub event_id: i64,
    pub published_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` pending events below the attempt ceiling, oldest first.
    async fn pending_events(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<OutboxEvent>, LedgerError>;

    /// Saves a whole batch of attempts in one transaction.
    async fn record_deliveries(&self, deliveries: &[DeliveryRecord]) -> Result<(), LedgerError>;

    /// Pending events that exhausted their attempts.
    async fn stuck_events(&self, max_attempts: i32) -> Result<Vec<OutboxEvent>, LedgerError>;
}

#[async_trait]
impl<S: OutboxStore + ?Sized> OutboxStore for Arc<S> {
    async fn pending_events(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<OutboxEvent>, LedgerError> {
        (**self).pending_events(limit, max_attempts).await
    }

    async fn record_deliveries(&self, deliveries: &[DeliveryRecord]) -> Result<(), LedgerError> {
        (**self).record_deliveries(deliveries).await
    }

    async fn stuck_events(&self, max_attempts: i32) -> Result<Vec<OutboxEvent>, LedgerError> {
        (**self).stuck_events(max_attempts).await
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_attempts: i32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 10,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishReport {
    pub published: Vec<i64>,
    pub failed: Vec<i64>,
    /// Events whose failed attempt in this poll took them to the ceiling.
    pub stuck: Vec<i64>,
}

pub struct OutboxPublisher<S, B> {
    store: S,
    bus: B,
    config: PublisherConfig,
}

impl<S: OutboxStore, B: MessageBus> OutboxPublisher<S, B> {
    pub fn new(store: S, bus: B, config: PublisherConfig) -> Self {
        Self { store, bus, config }
    }

    /// Polls on a fixed interval until `shutdown` flips to true. A poll that
    /// already started always finishes, including its batch commit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "Outbox publisher started"
        );
        self.report_stuck().await;

        let mut interval = time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.publish_pending().await {
                error!("Error processing outbox events: {}", e);
            }
        }

        info!("Outbox publisher stopped");
    }

    /// One poll: relay the oldest pending events and save every attempt in a
    /// single transaction afterwards. If that commit fails the events stay
    /// pending and are published again on the next poll.
    pub async fn publish_pending(&self) -> Result<PublishReport, LedgerError> {
        let events = self
            .store
            .pending_events(self.config.batch_size, self.config.max_attempts)
            .await?;

        if events.is_empty() {
            return Ok(PublishReport::default());
        }

        debug!(count = events.len(), "Processing pending outbox events");

        let mut report = PublishReport::default();
        let mut deliveries = Vec::with_capacity(events.len());

        for event in &events {
            match self.publish_event(event).await {
                Ok(()) => {
                    info!(
                        event_id = event.id,
                        event_type = %event.event_type,
                        aggregate_id = %event.aggregate_id,
                        "Published outbox event"
                    );
                    report.published.push(event.id);
                    deliveries.push(DeliveryRecord {
                        event_id: event.id,
                        published_at: Some(Utc::now()),
                    });
                }
                Err(e) => {
                    let attempts = event.attempts + 1;
                    warn!(
                        event_id = event.id,
                        event_type = %event.event_type,
                        attempts,
                        error = %e,
                        "Failed to publish outbox event"
                    );
                    report.failed.push(event.id);
                    if attempts >= self.config.max_attempts {
                        error!(
                            event_id = event.id,
                            event_type = %event.event_type,
                            aggregate_id = %event.aggregate_id,
                            attempts,
                            "Outbox event stuck after exhausting its delivery attempts"
                        );
                        report.stuck.push(event.id);
                    }
                    deliveries.push(DeliveryRecord {
                        event_id: event.id,
                        published_at: None,
                    });
                }
            }
        }

        self.store.record_deliveries(&deliveries).await?;

        Ok(report)
    }

    pub async fn stuck_events(&self) -> Result<Vec<OutboxEvent>, LedgerError> {
        self.store.stuck_events(self.config.max_attempts).await
    }

    async fn publish_event(&self, event: &OutboxEvent) -> Result<(), BusError> {
        let message = OutboundMessage::from_outbox(event).map_err(|e| BusError::Publish {
            topic: topic_for(&event.event_type).to_string(),
            reason: e.to_string(),
        })?;
        self.bus.publish(&message).await
    }

    async fn report_stuck(&self) {
        match self.stuck_events().await {
            Ok(stuck) => {
                for event in stuck {
                    error!(
                        event_id = event.id,
                        event_type = %event.event_type,
                        aggregate_id = %event.aggregate_id,
                        attempts = event.attempts,
                        "Stuck outbox event awaiting operator attention"
                    );
                }
            }
            Err(e) => warn!("Could not list stuck outbox events: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::events::{InvoiceCreated, LineItem, STOCK_TOPIC};
    use crate::memory::MemoryLedger;

    type Ledger = MemoryLedger<()>;

    async fn commit_event(ledger: &Ledger, event_type: &str) -> OutboxEvent {
        let event = SagaEvent::InvoiceCreated(InvoiceCreated {
            invoice_id: Uuid::new_v4(),
            items: vec![LineItem::new(Uuid::new_v4(), 2)],
        });
        let mut new = NewOutboxEvent::from_event(&event).unwrap();
        new.event_type = event_type.to_string();
        ledger
            .transaction(|state| Ok::<_, LedgerError>(state.outbox.insert(new)))
            .await
            .unwrap()
    }

    fn publisher(
        ledger: &Ledger,
        bus: &InMemoryBus,
        max_attempts: i32,
    ) -> OutboxPublisher<Ledger, InMemoryBus> {
        OutboxPublisher::new(
            ledger.clone(),
            bus.clone(),
            PublisherConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 10,
                max_attempts,
            },
        )
    }

    #[tokio::test]
    async fn publishes_pending_events_and_marks_them() {
        let ledger = Ledger::new();
        let bus = InMemoryBus::new();
        let event = commit_event(&ledger, "ReservaConfirmada").await;

        let report = publisher(&ledger, &bus, 5).publish_pending().await.unwrap();
        assert_eq!(report.published, vec![event.id]);

        let published = bus.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_id, event.id.to_string());
        assert_eq!(published[0].topic, STOCK_TOPIC);
        let payload: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(payload, event.payload);

        let stored = ledger.snapshot().await.outbox.events()[0].clone();
        assert!(stored.published_at.is_some());
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn broker_failures_only_count_the_attempt() {
        let ledger = Ledger::new();
        let bus = InMemoryBus::new();
        let event = commit_event(&ledger, "ReservaFalhou").await;
        let publisher = publisher(&ledger, &bus, 5);

        bus.set_outage(true).await;
        let report = publisher.publish_pending().await.unwrap();
        assert_eq!(report.failed, vec![event.id]);
        assert!(report.stuck.is_empty());

        let stored = ledger.snapshot().await.outbox.events()[0].clone();
        assert!(stored.published_at.is_none());
        assert_eq!(stored.attempts, 1);

        bus.set_outage(false).await;
        let report = publisher.publish_pending().await.unwrap();
        assert_eq!(report.published, vec![event.id]);
        assert_eq!(ledger.snapshot().await.outbox.events()[0].attempts, 2);
    }

    #[tokio::test]
    async fn events_past_the_ceiling_are_parked_for_operators() {
        let ledger = Ledger::new();
        let bus = InMemoryBus::new();
        let event = commit_event(&ledger, "ReservaFalhou").await;
        let publisher = publisher(&ledger, &bus, 3);

        bus.set_outage(true).await;
        publisher.publish_pending().await.unwrap();
        publisher.publish_pending().await.unwrap();
        let report = publisher.publish_pending().await.unwrap();
        assert_eq!(report.stuck, vec![event.id]);

        bus.set_outage(false).await;
        let report = publisher.publish_pending().await.unwrap();
        assert_eq!(report, PublishReport::default());
        assert!(bus.published().await.is_empty());

        let stuck = publisher.stuck_events().await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, event.id);
    }

    #[tokio::test]
    async fn a_crash_before_marking_republishes_with_the_same_identity() {
        let ledger = Ledger::new();
        let bus = InMemoryBus::new();
        let event = commit_event(&ledger, "ReservaConfirmada").await;
        let publisher = publisher(&ledger, &bus, 5);

        ledger.fail_next_commit();
        assert!(publisher.publish_pending().await.is_err());
        assert!(ledger.snapshot().await.outbox.events()[0].published_at.is_none());

        publisher.publish_pending().await.unwrap();

        let published = bus.published().await;
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|m| m.message_id == event.id.to_string()));
        assert!(ledger.snapshot().await.outbox.events()[0].published_at.is_some());
    }

    #[tokio::test]
    async fn one_failing_event_does_not_hold_back_the_batch() {
        let ledger = Ledger::new();
        let bus = InMemoryBus::new();
        let first = commit_event(&ledger, "ReservaConfirmada").await;
        let second = commit_event(&ledger, "ReservaFalhou").await;

        bus.fail_next(1).await;
        let report = publisher(&ledger, &bus, 5).publish_pending().await.unwrap();

        assert_eq!(report.failed, vec![first.id]);
        assert_eq!(report.published, vec![second.id]);
    }

    #[tokio::test]
    async fn run_relays_until_shutdown() {
        let ledger = Ledger::new();
        let bus = InMemoryBus::new();
        commit_event(&ledger, "NotaFiscalCriada").await;

        let publisher = Arc::new(publisher(&ledger, &bus, 5));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let publisher = Arc::clone(&publisher);
            async move { publisher.run(rx).await }
        });

        time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert_eq!(bus.published().await.len(), 1);
    }
}
