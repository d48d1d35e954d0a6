use anyhow::Result;
use clap::Parser;
use hris_shared::kafka::KafkaWriter;
use hris_shared::{
    db, telemetry, ClaimMode, ConfigError, KafkaConfig, OutboxPublisher, PgOutboxStore,
    PublisherConfig,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "outbox-worker")]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "KAFKA_BROKERS")]
    kafka_brokers: String,

    #[arg(long, env = "KAFKA_CLIENT_ID", default_value = "go-hris-outbox-worker")]
    client_id: String,

    #[arg(long, env = "PUBLISH_INTERVAL_MS", default_value = "3000")]
    publish_interval_ms: u64,

    #[arg(long, env = "OUTBOX_BATCH_SIZE", default_value = "50")]
    batch_size: i64,

    /// Failed attempts after which a row is parked; unlimited when unset.
    #[arg(long, env = "OUTBOX_MAX_ATTEMPTS")]
    max_attempts: Option<i32>,

    /// Enables skip-locked claiming for running several workers.
    #[arg(long, env = "OUTBOX_CLAIM_LEASE_MS")]
    claim_lease_ms: Option<u64>,

    #[arg(long, env = "DATABASE_POOL_SIZE", default_value = "4")]
    pool_size: u32,
}

impl Args {
    fn publisher_config(&self) -> Result<PublisherConfig, ConfigError> {
        PublisherConfig::default()
            .with_interval(Duration::from_millis(self.publish_interval_ms))
            .with_batch_size(self.batch_size)
    }

    fn claim_mode(&self) -> ClaimMode {
        match self.claim_lease_ms {
            Some(ms) => ClaimMode::SkipLocked {
                lease: Duration::from_millis(ms),
            },
            None => ClaimMode::Shared,
        }
    }

    fn max_attempts(&self) -> Result<Option<i32>, ConfigError> {
        match self.max_attempts {
            Some(n) if n <= 0 => Err(ConfigError::Invalid {
                var: "OUTBOX_MAX_ATTEMPTS",
                reason: format!("must be positive, got {n}"),
            }),
            other => Ok(other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let args = Args::parse();

    let kafka = KafkaConfig::new(&args.kafka_brokers, &args.client_id)?;
    let config = args.publisher_config()?;
    let max_attempts = args.max_attempts()?;

    db::run_migrations(&args.database_url)?;
    let pool = db::connect(&args.database_url, args.pool_size).await?;

    let store = PgOutboxStore::new(pool)
        .with_claim_mode(args.claim_mode())
        .with_max_attempts(max_attempts);
    let writer = KafkaWriter::new(&kafka)?;
    let publisher = OutboxPublisher::new(store, writer, config).with_max_attempts(max_attempts);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    info!(claim_mode = ?args.claim_mode(), ?max_attempts, "Outbox worker ready");
    publisher.run(cancel).await;

    Ok(())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
    cancel.cancel();
}
