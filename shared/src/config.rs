use clap::Args;
use std::time::Duration;

use crate::consumer::ConsumerConfig;
use crate::outbox::PublisherConfig;

#[derive(Debug, Clone, Args)]
pub struct DatabaseArgs {
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "DB_POOL_SIZE", default_value_t = 10)]
    pub db_pool_size: u32,
}

#[derive(Debug, Clone, Args)]
pub struct KafkaArgs {
    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    pub kafka_brokers: String,

    /// Producer delivery timeout in milliseconds.
    #[arg(long, env = "KAFKA_TIMEOUT_MS", default_value_t = 5000)]
    pub kafka_timeout_ms: u64,
}

impl KafkaArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_timeout_ms)
    }
}

#[derive(Debug, Clone, Args)]
pub struct OutboxArgs {
    #[arg(long, env = "OUTBOX_POLL_INTERVAL_MS", default_value_t = 2000)]
    pub outbox_poll_interval_ms: u64,

    #[arg(long, env = "OUTBOX_BATCH_SIZE", default_value_t = 10)]
    pub outbox_batch_size: i64,

    /// Attempts after which an unpublished event is left for an operator.
    #[arg(long, env = "OUTBOX_MAX_ATTEMPTS", default_value_t = 5)]
    pub outbox_max_attempts: i32,
}

impl From<&OutboxArgs> for PublisherConfig {
    fn from(args: &OutboxArgs) -> Self {
        PublisherConfig {
            poll_interval: Duration::from_millis(args.outbox_poll_interval_ms),
            batch_size: args.outbox_batch_size.max(1),
            max_attempts: args.outbox_max_attempts.max(1),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ConsumerArgs {
    #[arg(long, env = "CONSUMER_MAX_ATTEMPTS", default_value_t = 5)]
    pub consumer_max_attempts: u32,

    #[arg(long, env = "CONSUMER_RETRY_DELAY_MS", default_value_t = 1000)]
    pub consumer_retry_delay_ms: u64,
}

impl From<&ConsumerArgs> for ConsumerConfig {
    fn from(args: &ConsumerArgs) -> Self {
        ConsumerConfig {
            max_attempts: args.consumer_max_attempts.max(1),
            retry_delay: Duration::from_millis(args.consumer_retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct TelemetryArgs {
    /// Emit logs as JSON lines.
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}
