pub mod bus;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod kafka;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod saga;
pub mod schema;
pub mod telemetry;

pub use bus::{InMemoryBus, MessageBus, OutboundMessage};
pub use consumer::{
    BatchReport, ConsumerConfig, DeliveryOutcome, Disposition, EventConsumer, EventHandler,
    Idempotent, InboundMessage,
};
pub use error::{BusError, EventError, LedgerError};
pub use events::{
    EventType, InvoiceCancelled, InvoiceCreated, LineItem, ReservationConfirmed,
    ReservationFailed, SagaEvent,
};
pub use memory::MemoryLedger;
pub use outbox::{
    DeliveryRecord, NewOutboxEvent, OutboxEvent, OutboxPublisher, OutboxStore, PublishReport,
    PublisherConfig,
};
pub use saga::{InvalidTransition, SagaState, SagaTransition};
