//! services/worker/src/bin/maintenance.rs
//!
//! Periodic maintenance sweeps, intended to run on a schedule (cron or a
//! container job): releases expired booking holds and expires lapsed lesson
//! packages. Each sweep runs in its own transaction and is idempotent, so a
//! crashed or repeated run is harmless.

use std::sync::Arc;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use tutoring_core::{Actor, BillingService, BookingService, Role, SystemClock};
use worker_lib::{
    adapters::db::{run_migrations, PgSession, PgStore},
    config::Config,
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
    info!("Configuration loaded. Starting maintenance sweeps...");

    // --- 2. Connect to Database & Run Migrations ---
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    run_migrations(&pool).await?;

    // The sweeps are system-initiated, not tied to any real user.
    let system = Actor {
        id: Uuid::nil(),
        role: Role::Admin,
    };

    let expired_holds = sweep_expired_holds(&pool, &config, &system).await?;
    info!(count = expired_holds, "Expired booking holds released.");

    let expired_packages = sweep_expired_packages(&pool, &system).await?;
    info!(count = expired_packages, "Lapsed lesson packages expired.");

    Ok(())
}

async fn sweep_expired_holds(
    pool: &PgPool,
    config: &Config,
    system: &Actor,
) -> Result<usize, WorkerError> {
    let session = PgSession::begin(pool).await?;
    let store = Arc::new(PgStore::new(session.clone()));
    let service = BookingService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store,
        Arc::new(SystemClock),
        config.booking,
    );
    match service.expire_holds(system).await {
        Ok(count) => {
            session.commit().await?;
            Ok(count)
        }
        Err(error) => {
            session.rollback().await?;
            Err(error.into())
        }
    }
}

async fn sweep_expired_packages(pool: &PgPool, system: &Actor) -> Result<usize, WorkerError> {
    let session = PgSession::begin(pool).await?;
    let store = Arc::new(PgStore::new(session.clone()));
    let service = BillingService::new(store.clone(), store, Arc::new(SystemClock));
    match service.expire_packages(system).await {
        Ok(count) => {
            session.commit().await?;
            Ok(count)
        }
        Err(error) => {
            session.rollback().await?;
            Err(error.into())
        }
    }
}
