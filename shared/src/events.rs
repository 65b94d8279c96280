use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::EventError;

pub const BILLING_TOPIC: &str = "billing-events";
pub const STOCK_TOPIC: &str = "stock-events";
pub const FALLBACK_TOPIC: &str = "domain-events";

/// Tags of the events exchanged by the two services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    NotaFiscalCriada,
    NotaFiscalCancelada,
    ReservaConfirmada,
    ReservaFalhou,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NotaFiscalCriada => "NotaFiscalCriada",
            EventType::NotaFiscalCancelada => "NotaFiscalCancelada",
            EventType::ReservaConfirmada => "ReservaConfirmada",
            EventType::ReservaFalhou => "ReservaFalhou",
        }
    }

    /// Billing announces invoices, stock announces reservation outcomes.
    pub fn topic(&self) -> &'static str {
        match self {
            EventType::NotaFiscalCriada | EventType::NotaFiscalCancelada => BILLING_TOPIC,
            EventType::ReservaConfirmada | EventType::ReservaFalhou => STOCK_TOPIC,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotaFiscalCriada" => Ok(EventType::NotaFiscalCriada),
            "NotaFiscalCancelada" => Ok(EventType::NotaFiscalCancelada),
            "ReservaConfirmada" => Ok(EventType::ReservaConfirmada),
            "ReservaFalhou" => Ok(EventType::ReservaFalhou),
            other => Err(EventError::UnknownType(other.to_string())),
        }
    }
}

/// Topic for a raw event tag, falling back to the catch-all topic.
pub fn topic_for(event_type: &str) -> &'static str {
    event_type
        .parse::<EventType>()
        .map(|t| t.topic())
        .unwrap_or(FALLBACK_TOPIC)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(rename = "produtoId")]
    pub product_id: Uuid,
    #[serde(rename = "quantidade")]
    pub quantity: i32,
}

impl LineItem {
    pub fn new(product_id: Uuid, quantity: i32) -> Self {
        Self { product_id, quantity }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCreated {
    #[serde(rename = "notaId")]
    pub invoice_id: Uuid,
    #[serde(rename = "itens", default)]
    pub items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCancelled {
    #[serde(rename = "notaId")]
    pub invoice_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ConfirmedWire")]
pub struct ReservationConfirmed {
    #[serde(rename = "notaId")]
    pub invoice_id: Uuid,
    #[serde(rename = "itens", default)]
    pub items: Vec<LineItem>,
}

/// Older producers sent a single line as top-level `produtoId`/`quantidade`.
#[derive(Deserialize)]
struct ConfirmedWire {
    #[serde(rename = "notaId")]
    invoice_id: Uuid,
    #[serde(rename = "itens", default)]
    items: Vec<LineItem>,
    #[serde(rename = "produtoId", default)]
    product_id: Option<Uuid>,
    #[serde(rename = "quantidade", default)]
    quantity: i32,
}

impl From<ConfirmedWire> for ReservationConfirmed {
    fn from(wire: ConfirmedWire) -> Self {
        let mut items = wire.items;
        if items.is_empty() {
            items.extend(wire.product_id.map(|id| LineItem::new(id, wire.quantity)));
        }
        Self {
            invoice_id: wire.invoice_id,
            items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationFailed {
    #[serde(rename = "notaId")]
    pub invoice_id: Uuid,
    #[serde(rename = "motivo")]
    pub reason: String,
}

/// A decoded saga event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaEvent {
    InvoiceCreated(InvoiceCreated),
    InvoiceCancelled(InvoiceCancelled),
    ReservationConfirmed(ReservationConfirmed),
    ReservationFailed(ReservationFailed),
}

impl SagaEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            SagaEvent::InvoiceCreated(_) => EventType::NotaFiscalCriada,
            SagaEvent::InvoiceCancelled(_) => EventType::NotaFiscalCancelada,
            SagaEvent::ReservationConfirmed(_) => EventType::ReservaConfirmada,
            SagaEvent::ReservationFailed(_) => EventType::ReservaFalhou,
        }
    }

    /// The invoice is the aggregate every saga event belongs to.
    pub fn invoice_id(&self) -> Uuid {
        match self {
            SagaEvent::InvoiceCreated(e) => e.invoice_id,
            SagaEvent::InvoiceCancelled(e) => e.invoice_id,
            SagaEvent::ReservationConfirmed(e) => e.invoice_id,
            SagaEvent::ReservationFailed(e) => e.invoice_id,
        }
    }

    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            SagaEvent::InvoiceCreated(e) => serde_json::to_value(e),
            SagaEvent::InvoiceCancelled(e) => serde_json::to_value(e),
            SagaEvent::ReservationConfirmed(e) => serde_json::to_value(e),
            SagaEvent::ReservationFailed(e) => serde_json::to_value(e),
        }
    }

    pub fn decode(event_type: &str, payload: &[u8]) -> Result<Self, EventError> {
        let kind: EventType = event_type.parse()?;
        let malformed = |source| EventError::Malformed {
            event_type: event_type.to_string(),
            source,
        };

        let event = match kind {
            EventType::NotaFiscalCriada => {
                SagaEvent::InvoiceCreated(serde_json::from_slice(payload).map_err(malformed)?)
            }
            EventType::NotaFiscalCancelada => {
                SagaEvent::InvoiceCancelled(serde_json::from_slice(payload).map_err(malformed)?)
            }
            EventType::ReservaConfirmada => {
                SagaEvent::ReservationConfirmed(serde_json::from_slice(payload).map_err(malformed)?)
            }
            EventType::ReservaFalhou => {
                SagaEvent::ReservationFailed(serde_json::from_slice(payload).map_err(malformed)?)
            }
        };

        Ok(event)
    }
}
