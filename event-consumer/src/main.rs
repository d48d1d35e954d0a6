use anyhow::Result;
use clap::{Parser, Subcommand};
use hris_shared::events::{EMPLOYEE_LIFECYCLE_TOPIC, PAYSLIP_REQUESTED_TOPIC};
use hris_shared::kafka::KafkaSource;
use hris_shared::{db, telemetry, ConsumerConfig, EventConsumer, KafkaConfig, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use event_consumer::domain::{PgEmployeeSalaries, PgPayrolls};
use event_consumer::handlers::{EmployeeSalaryHandler, PayslipHandler};

#[derive(Parser, Debug)]
#[command(name = "event-consumer")]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "KAFKA_BROKERS")]
    kafka_brokers: String,

    /// Overrides the consumer's own group; a new group replays from the
    /// earliest offset.
    #[arg(long, env = "CONSUMER_GROUP_ID")]
    group_id: Option<String>,

    #[arg(long, env = "CONSUMER_RETRY_DELAY_MS", default_value = "1000")]
    retry_delay_ms: u64,

    #[arg(long, env = "DATABASE_POOL_SIZE", default_value = "4")]
    pool_size: u32,

    #[command(subcommand)]
    consumer: ConsumerKind,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumerKind {
    /// Default salary row for every created employee.
    EmployeeSalary,
    /// Payslip generation for payroll requests.
    Payslip,
}

impl ConsumerKind {
    fn topic(self) -> &'static str {
        match self {
            ConsumerKind::EmployeeSalary => EMPLOYEE_LIFECYCLE_TOPIC,
            ConsumerKind::Payslip => PAYSLIP_REQUESTED_TOPIC,
        }
    }

    fn group_id(self) -> &'static str {
        match self {
            ConsumerKind::EmployeeSalary => "go-hris-employee-salary",
            ConsumerKind::Payslip => "go-hris-payslip",
        }
    }
}

impl Args {
    fn consumer_config(&self) -> Result<ConsumerConfig, hris_shared::ConfigError> {
        let group_id = self
            .group_id
            .clone()
            .unwrap_or_else(|| self.consumer.group_id().to_string());
        Ok(ConsumerConfig::new(group_id, self.consumer.topic())?
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let args = Args::parse();

    let consumer_config = args.consumer_config()?;
    let kafka = KafkaConfig::new(&args.kafka_brokers, &consumer_config.group_id)?;

    db::run_migrations(&args.database_url)?;
    let pool = db::connect(&args.database_url, args.pool_size).await?;
    let source = KafkaSource::subscribe(&kafka, &consumer_config)?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    info!(consumer = ?args.consumer, group = %consumer_config.group_id, "Event consumer ready");

    match args.consumer {
        ConsumerKind::EmployeeSalary => {
            let handler =
                EmployeeSalaryHandler::new(PgEmployeeSalaries::new(pool), Arc::new(SystemClock));
            EventConsumer::new(source, handler, consumer_config)
                .run(cancel)
                .await;
        }
        ConsumerKind::Payslip => {
            let handler = PayslipHandler::new(PgPayrolls::new(pool));
            EventConsumer::new(source, handler, consumer_config)
                .run(cancel)
                .await;
        }
    }

    Ok(())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
    cancel.cancel();
}
