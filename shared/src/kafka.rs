use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::{MessageBus, OutboundMessage};
use crate::consumer::{DeliveryOutcome, EventConsumer, EventHandler, InboundMessage};
use crate::error::BusError;

pub const MESSAGE_ID_HEADER: &str = "message-id";
pub const EVENT_TYPE_HEADER: &str = "event-type";
pub const AGGREGATE_ID_HEADER: &str = "aggregate-id";
pub const OCCURRED_AT_HEADER: &str = "occurred-at";

#[derive(Clone)]
pub struct KafkaBus {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaBus {
    pub fn new(brokers: &str, timeout: Duration) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| BusError::Unavailable(format!("failed to create producer: {}", e)))?;

        Ok(Self { producer, timeout })
    }
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BusError> {
        let key = message.aggregate_id.to_string();
        let occurred_at = message.occurred_at.to_rfc3339();

        let mut headers = OwnedHeaders::new()
            .insert(Header { key: MESSAGE_ID_HEADER, value: Some(message.message_id.as_str()) })
            .insert(Header { key: EVENT_TYPE_HEADER, value: Some(message.event_type.as_str()) })
            .insert(Header { key: AGGREGATE_ID_HEADER, value: Some(key.as_str()) })
            .insert(Header { key: OCCURRED_AT_HEADER, value: Some(occurred_at.as_str()) });
        for (name, value) in &message.headers {
            headers = headers.insert(Header { key: name.as_str(), value: Some(value.as_str()) });
        }

        let record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .key(&key)
            .headers(headers);

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| BusError::Publish {
                topic: message.topic.clone(),
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

/// Consumer with manual commits: an offset is committed only after the local
/// transaction for its message committed, or after the message reached the
/// dead-letter topic.
pub fn subscribe(
    brokers: &str,
    group_id: &str,
    topics: &[&str],
) -> Result<StreamConsumer, BusError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", group_id)
        .set("bootstrap.servers", brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()
        .map_err(|e| BusError::Subscribe {
            topics: topics.iter().map(|t| t.to_string()).collect(),
            reason: e.to_string(),
        })?;

    consumer.subscribe(topics).map_err(|e| BusError::Subscribe {
        topics: topics.iter().map(|t| t.to_string()).collect(),
        reason: e.to_string(),
    })?;

    Ok(consumer)
}

pub fn inbound_message(message: &BorrowedMessage<'_>) -> InboundMessage {
    let mut message_id = None;
    let mut event_type = None;

    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            let value = header
                .value
                .and_then(|v| std::str::from_utf8(v).ok())
                .map(str::to_string);
            match header.key {
                MESSAGE_ID_HEADER => message_id = value,
                EVENT_TYPE_HEADER => event_type = value,
                _ => {}
            }
        }
    }

    InboundMessage {
        topic: message.topic().to_string(),
        delivery_tag: format!("{}:{}", message.partition(), message.offset()),
        message_id,
        event_type,
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

/// Drives `processor` from a Kafka subscription until `shutdown` flips.
///
/// Returns an error when a message can neither be processed nor
/// dead-lettered: committing past it would lose it, so the service stops and
/// the group rebalances from the last committed offset.
pub async fn run_consumer<H, B>(
    consumer: StreamConsumer,
    processor: &EventConsumer<H>,
    dead_letters: &B,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BusError>
where
    H: EventHandler,
    B: MessageBus,
{
    let mut message_stream = consumer.stream();
    info!("Event consumer started, waiting for messages");

    loop {
        let next = tokio::select! {
            next = message_stream.next() => next,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let m = match next {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                error!("Error receiving message: {}", e);
                continue;
            }
            None => break,
        };

        let inbound = inbound_message(&m);

        if let DeliveryOutcome::DeadLettered { reason } = processor.deliver(&inbound).await {
            let dead_letter = OutboundMessage::dead_letter(&inbound, &reason);
            if let Err(e) = dead_letters.publish(&dead_letter).await {
                error!(
                    message_id = %inbound.identity(),
                    error = %e,
                    "Failed to dead-letter message, stopping consumer"
                );
                return Err(e);
            }
            warn!(
                message_id = %inbound.identity(),
                topic = %dead_letter.topic,
                "Message routed to dead-letter topic"
            );
        }

        if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
            warn!(
                topic = m.topic(),
                partition = m.partition(),
                offset = m.offset(),
                error = %e,
                "Failed to commit offset (message may be redelivered)"
            );
        }
    }

    info!("Event consumer stopped");
    Ok(())
}
