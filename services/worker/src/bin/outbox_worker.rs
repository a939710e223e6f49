//! services/worker/src/bin/outbox_worker.rs
//!
//! The outbox relay worker. Each cycle runs inside one database transaction:
//! requeue failed events whose backoff has elapsed, claim a batch of pending
//! events, and materialize notifications for each. Runs a single cycle in
//! `once` mode or loops forever in `poll` mode.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tutoring_core::{OutboxRelay, RelayStats, SystemClock};
use worker_lib::{
    adapters::db::{run_migrations, PgSession, PgStore},
    config::{Config, WorkerMode},
    error::WorkerError,
};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Config::from_env()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting outbox worker...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Database migrations complete.");

    // --- 3. Relay ---
    match config.worker_mode {
        WorkerMode::Once => {
            let stats = run_cycle(&pool, &config).await?;
            info!(
                requeued = stats.requeued,
                processed = stats.processed,
                failed = stats.failed,
                dispatched = stats.dispatched,
                "Relay cycle complete."
            );
        }
        WorkerMode::Poll => loop {
            match run_cycle(&pool, &config).await {
                Ok(stats) => {
                    if stats.processed > 0 || stats.failed > 0 || stats.requeued > 0 {
                        info!(
                            requeued = stats.requeued,
                            processed = stats.processed,
                            failed = stats.failed,
                            dispatched = stats.dispatched,
                            "Relay cycle complete."
                        );
                    }
                }
                Err(error) => error!(%error, "Relay cycle failed."),
            }
            tokio::time::sleep(Duration::from_secs(config.poll_seconds)).await;
        },
    }

    Ok(())
}

/// Runs one relay cycle in its own transaction. The transaction rolls back
/// if the cycle errors, so no event is left half-updated.
async fn run_cycle(pool: &PgPool, config: &Config) -> Result<RelayStats, WorkerError> {
    let session = PgSession::begin(pool).await?;
    let store = Arc::new(PgStore::new(session.clone()));
    let relay = OutboxRelay::new(
        store.clone(),
        store.clone(),
        store,
        Arc::new(SystemClock),
        config.outbox,
    );
    match relay.run_once().await {
        Ok(stats) => {
            session.commit().await?;
            Ok(stats)
        }
        Err(error) => {
            session.rollback().await?;
            Err(error.into())
        }
    }
}
