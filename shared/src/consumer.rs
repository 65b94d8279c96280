use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::error::{EventError, LedgerError};
use crate::events::SagaEvent;

/// A message as delivered by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    /// Transport position of this delivery, e.g. `<partition>:<offset>`.
    pub delivery_tag: String,
    pub message_id: Option<String>,
    pub event_type: Option<String>,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// The dedup key: the publisher-assigned id, or a transport-derived
    /// fallback when the producer did not set one.
    pub fn identity(&self) -> String {
        match &self.message_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!(
                "{}:{}-{}",
                self.topic,
                self.delivery_tag,
                self.event_type.as_deref().unwrap_or("unknown")
            ),
        }
    }
}

/// What happened to a message that was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Side effect applied and marker stored in one transaction.
    Applied,
    /// The marker already existed; nothing was done.
    Duplicate,
    /// Acknowledged without effect (unknown type, stale or unknown aggregate).
    Ignored,
}

/// Wraps the result of a guarded ledger operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Idempotent<T> {
    Applied(T),
    Duplicate,
}

impl<T> Idempotent<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            Idempotent::Applied(value) => Some(value),
            Idempotent::Duplicate => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Idempotent::Duplicate)
    }
}

/// Domain reaction to one decoded event.
///
/// Implementations must insert the processed-message marker for
/// `message_id` in the same transaction as their side effect and report
/// `Disposition::Duplicate` when it already existed.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, message_id: &str, event: SagaEvent) -> Result<Disposition, LedgerError>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    async fn handle(&self, message_id: &str, event: SagaEvent) -> Result<Disposition, LedgerError> {
        (**self).handle(message_id, event).await
    }
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Decode(#[from] EventError),

    #[error(transparent)]
    Handler(#[from] LedgerError),
}

impl ConsumerError {
    /// Decode failures will fail the same way on every redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsumerError::Handler(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Acknowledged(Disposition),
    /// Retries exhausted or poison payload; the transport must route the
    /// message to the dead-letter destination before acknowledging it.
    DeadLettered { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub acknowledged: Vec<String>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

pub struct EventConsumer<H> {
    handler: H,
    config: ConsumerConfig,
}

impl<H: EventHandler> EventConsumer<H> {
    pub fn new(handler: H, config: ConsumerConfig) -> Self {
        Self { handler, config }
    }

    /// One processing attempt. `Ok` means the message may be acknowledged.
    pub async fn process(&self, message: &InboundMessage) -> Result<Disposition, ConsumerError> {
        let message_id = message.identity();
        let event_type = message.event_type.as_deref().unwrap_or_default();

        info!(message_id = %message_id, event_type, topic = %message.topic, "Processing message");

        let event = match SagaEvent::decode(event_type, &message.payload) {
            Ok(event) => event,
            Err(EventError::UnknownType(kind)) => {
                warn!(message_id = %message_id, event_type = %kind, "Unknown event type, ignoring");
                return Ok(Disposition::Ignored);
            }
            Err(e) => return Err(e.into()),
        };

        let disposition = self.handler.handle(&message_id, event).await?;

        match disposition {
            Disposition::Duplicate => {
                info!(message_id = %message_id, "Message already processed, ignoring")
            }
            Disposition::Ignored => info!(message_id = %message_id, "Message marked as ignored"),
            Disposition::Applied => info!(message_id = %message_id, "Message processed"),
        }

        Ok(disposition)
    }

    /// Processes with bounded in-process redelivery. Transient failures are
    /// retried after `retry_delay`; poison payloads and exhausted retries come
    /// back as `DeadLettered`.
    pub async fn deliver(&self, message: &InboundMessage) -> DeliveryOutcome {
        let message_id = message.identity();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.process(message).await {
                Ok(disposition) => return DeliveryOutcome::Acknowledged(disposition),
                Err(e) if !e.is_retryable() => {
                    error!(message_id = %message_id, error = %e, "Poison message, dead-lettering");
                    return DeliveryOutcome::DeadLettered { reason: e.to_string() };
                }
                Err(e) if attempt >= self.config.max_attempts => {
                    error!(
                        message_id = %message_id,
                        attempts = attempt,
                        error = %e,
                        "Message failed on every attempt, dead-lettering"
                    );
                    return DeliveryOutcome::DeadLettered { reason: e.to_string() };
                }
                Err(e) => {
                    warn!(
                        message_id = %message_id,
                        attempt,
                        error = %e,
                        "Error processing message, will retry"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// Each message is processed on its own; one failure never holds back the
    /// acknowledgement of the others.
    pub async fn process_batch(&self, batch: &[InboundMessage]) -> BatchReport {
        let mut report = BatchReport::default();

        for message in batch {
            match self.process(message).await {
                Ok(_) => report.acknowledged.push(message.identity()),
                Err(e) => {
                    error!(
                        message_id = %message.identity(),
                        error = %e,
                        "Error processing message in batch"
                    );
                    report.failures.push(message.identity());
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ReservationFailed, SagaEvent};
    use std::collections::HashSet;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<HashSet<String>>,
        applied: Mutex<Vec<SagaEvent>>,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(
            &self,
            message_id: &str,
            event: SagaEvent,
        ) -> Result<Disposition, LedgerError> {
            let mut failures = self.failures_left.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(LedgerError::Unavailable("database down".to_string()));
            }
            if !self.seen.lock().await.insert(message_id.to_string()) {
                return Ok(Disposition::Duplicate);
            }
            self.applied.lock().await.push(event);
            Ok(Disposition::Applied)
        }
    }

    fn consumer(failures: u32, max_attempts: u32) -> EventConsumer<Arc<RecordingHandler>> {
        let handler = RecordingHandler {
            failures_left: Mutex::new(failures),
            ..Default::default()
        };
        EventConsumer::new(
            Arc::new(handler),
            ConsumerConfig {
                max_attempts,
                retry_delay: Duration::from_millis(1),
            },
        )
    }

    fn failed_message(id: &str) -> InboundMessage {
        let event = SagaEvent::ReservationFailed(ReservationFailed {
            invoice_id: Uuid::new_v4(),
            reason: "insufficient stock".to_string(),
        });
        InboundMessage {
            topic: "stock-events".to_string(),
            delivery_tag: "0:1".to_string(),
            message_id: Some(id.to_string()),
            event_type: Some("ReservaFalhou".to_string()),
            payload: serde_json::to_vec(&event.to_payload().unwrap()).unwrap(),
        }
    }

    #[test]
    fn identity_falls_back_to_the_delivery_position() {
        let mut message = failed_message("7");
        assert_eq!(message.identity(), "7");

        message.message_id = None;
        assert_eq!(message.identity(), "stock-events:0:1-ReservaFalhou");
    }

    #[tokio::test]
    async fn redelivery_is_absorbed_as_duplicate() {
        let consumer = consumer(0, 3);
        let message = failed_message("1");

        assert_eq!(consumer.process(&message).await.unwrap(), Disposition::Applied);
        assert_eq!(consumer.process(&message).await.unwrap(), Disposition::Duplicate);
        assert_eq!(consumer.handler.applied.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_event_types_are_acknowledged_without_effect() {
        let consumer = consumer(0, 3);
        let mut message = failed_message("1");
        message.event_type = Some("Faturamento.ImpressaoSolicitada".to_string());

        assert_eq!(consumer.process(&message).await.unwrap(), Disposition::Ignored);
        assert!(consumer.handler.applied.lock().await.is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let consumer = consumer(2, 3);
        let outcome = consumer.deliver(&failed_message("1")).await;

        assert_eq!(outcome, DeliveryOutcome::Acknowledged(Disposition::Applied));
        assert_eq!(consumer.handler.applied.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_are_dead_lettered() {
        let consumer = consumer(10, 3);
        let outcome = consumer.deliver(&failed_message("1")).await;

        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { .. }));
        assert_eq!(*consumer.handler.failures_left.lock().await, 7);
    }

    #[tokio::test]
    async fn poison_payloads_are_dead_lettered_without_retry() {
        let consumer = consumer(0, 3);
        let mut message = failed_message("1");
        message.payload = b"{\"notaId\": 12".to_vec();

        let outcome = consumer.deliver(&message).await;
        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { .. }));
    }

    #[tokio::test]
    async fn one_bad_message_does_not_block_the_batch() {
        let consumer = consumer(0, 3);
        let mut poison = failed_message("2");
        poison.payload = b"garbage".to_vec();
        let batch = vec![failed_message("1"), poison, failed_message("3")];

        let report = consumer.process_batch(&batch).await;
        assert_eq!(report.acknowledged, vec!["1".to_string(), "3".to_string()]);
        assert_eq!(report.failures, vec!["2".to_string()]);
    }
}
