mod api;
mod models;

use anyhow::Result;
use clap::Parser;
use hris_shared::{db, telemetry, SystemClock};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "hris-api")]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "DATABASE_POOL_SIZE", default_value = "10")]
    pool_size: u32,

    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let args = Args::parse();

    db::run_migrations(&args.database_url)?;
    let pool = db::connect(&args.database_url, args.pool_size).await?;

    let app_state = api::AppState {
        pool,
        clock: Arc::new(SystemClock),
    };
    let app = api::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!(port = args.port, "HRIS API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HRIS API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
