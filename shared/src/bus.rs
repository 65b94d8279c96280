use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::consumer::InboundMessage;
use crate::error::BusError;
use crate::events::topic_for;
use crate::outbox::OutboxEvent;

/// A message ready for the broker. `message_id` is the identity consumers
/// deduplicate on.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub message_id: String,
    pub event_type: String,
    pub aggregate_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutboundMessage {
    pub fn from_outbox(event: &OutboxEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            topic: topic_for(&event.event_type).to_string(),
            message_id: event.id.to_string(),
            event_type: event.event_type.clone(),
            aggregate_id: event.aggregate_id,
            occurred_at: event.occurred_at,
            payload: serde_json::to_vec(&event.payload)?,
            headers: Vec::new(),
        })
    }

    /// Copy of an inbound message bound for `<topic>.dlq`.
    pub fn dead_letter(message: &InboundMessage, reason: &str) -> Self {
        let event_type = message.event_type.clone().unwrap_or_default();
        Self {
            topic: format!("{}.dlq", message.topic),
            message_id: message.identity(),
            aggregate_id: Uuid::nil(),
            occurred_at: Utc::now(),
            payload: message.payload.clone(),
            headers: vec![
                ("dead-letter-reason".to_string(), reason.to_string()),
                ("source-topic".to_string(), message.topic.clone()),
            ],
            event_type,
        }
    }
}

/// Publishing side of the broker.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Resolves only once the broker acknowledged the message.
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BusError>;
}

#[async_trait]
impl<B: MessageBus + ?Sized> MessageBus for Arc<B> {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BusError> {
        (**self).publish(message).await
    }
}

#[derive(Debug, Default)]
struct BusState {
    queue: VecDeque<OutboundMessage>,
    published: Vec<OutboundMessage>,
    offset: u64,
    outage: bool,
    failures_left: usize,
}

/// In-memory broker for tests: keeps every acknowledged message and lets a
/// test drain them as consumer deliveries.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every publish fails.
    pub async fn set_outage(&self, outage: bool) {
        self.state.lock().await.outage = outage;
    }

    /// Fail the next `count` publishes.
    pub async fn fail_next(&self, count: usize) {
        self.state.lock().await.failures_left = count;
    }

    /// Every message the broker ever acknowledged, in order.
    pub async fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().await.published.clone()
    }

    /// Removes the undelivered messages of `topic` and hands them out as
    /// consumer deliveries.
    pub async fn deliver(&self, topic: &str) -> Vec<InboundMessage> {
        let mut state = self.state.lock().await;
        let (matching, rest): (VecDeque<_>, VecDeque<_>) =
            state.queue.drain(..).partition(|m| m.topic == topic);
        state.queue = rest;

        let mut deliveries = Vec::with_capacity(matching.len());
        for message in matching {
            state.offset += 1;
            deliveries.push(InboundMessage {
                topic: message.topic,
                delivery_tag: format!("0:{}", state.offset),
                message_id: Some(message.message_id),
                event_type: Some(message.event_type),
                payload: message.payload,
            });
        }
        deliveries
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if state.outage {
            return Err(BusError::Unavailable("in-memory broker outage".to_string()));
        }
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(BusError::Publish {
                topic: message.topic.clone(),
                reason: "injected failure".to_string(),
            });
        }
        state.queue.push_back(message.clone());
        state.published.push(message.clone());
        Ok(())
    }
}
