use thiserror::Error;

/// Failures of the local ledger (database or its in-memory stand-in).
///
/// Every variant is an infrastructure fault: callers retry the enclosing
/// operation (publisher interval, broker redelivery) rather than treat it as a
/// business outcome.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl<E: std::error::Error + 'static> From<bb8::RunError<E>> for LedgerError {
    fn from(e: bb8::RunError<E>) -> Self {
        LedgerError::Pool(e.to_string())
    }
}

/// Failures talking to the message broker.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("failed to subscribe to {topics:?}: {reason}")]
    Subscribe { topics: Vec<String>, reason: String },
}

/// Failures turning a broker message back into a saga event.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("malformed {event_type} payload: {source}")]
    Malformed {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}
