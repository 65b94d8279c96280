use anyhow::Result;
use clap::Parser;
use diesel::{Connection, PgConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use shared::config::{ConsumerArgs, DatabaseArgs, KafkaArgs, OutboxArgs, TelemetryArgs};
use shared::events::BILLING_TOPIC;
use shared::kafka::{self, KafkaBus};
use shared::postgres::{build_pool, PgOutboxStore};
use shared::{telemetry, EventConsumer, OutboxPublisher};
use stock_service::{PgStockLedger, ReservationService, StockEventHandler};
use tokio::sync::watch;
use tracing::{error, info};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Parser)]
#[command(name = "stock-service")]
struct Args {
    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    kafka: KafkaArgs,

    #[command(flatten)]
    outbox: OutboxArgs,

    #[command(flatten)]
    consumer: ConsumerArgs,

    #[command(flatten)]
    telemetry: TelemetryArgs,

    #[arg(long, env = "CONSUMER_GROUP", default_value = "stock-service")]
    consumer_group: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init(args.telemetry.log_json);

    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&args.database.database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let pool = build_pool(&args.database.database_url, args.database.db_pool_size).await?;
    let bus = KafkaBus::new(&args.kafka.kafka_brokers, args.kafka.timeout())?;
    let subscription =
        kafka::subscribe(&args.kafka.kafka_brokers, &args.consumer_group, &[BILLING_TOPIC])?;

    let publisher = OutboxPublisher::new(
        PgOutboxStore::new(pool.clone()),
        bus.clone(),
        (&args.outbox).into(),
    );
    let processor = EventConsumer::new(
        StockEventHandler::new(ReservationService::new(PgStockLedger::new(pool))),
        (&args.consumer).into(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let publisher_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { publisher.run(shutdown).await }
    });
    let mut consumer_task = tokio::spawn(async move {
        kafka::run_consumer(subscription, &processor, &bus, shutdown_rx).await
    });

    info!(topic = BILLING_TOPIC, group = %args.consumer_group, "Stock service started");

    let stopped_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            None
        }
        result = &mut consumer_task => Some(result),
    };

    let _ = shutdown_tx.send(true);
    let consumer_result = match stopped_early {
        Some(result) => {
            error!("Event consumer stopped unexpectedly, shutting down");
            result
        }
        None => {
            info!("Shutdown signal received");
            consumer_task.await
        }
    };

    publisher_task.await?;
    consumer_result??;

    info!("Stock service stopped");
    Ok(())
}
