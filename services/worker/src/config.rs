//! services/worker/src/config.rs
//!
//! Loads worker configuration from environment variables. Every tunable has
//! a default except `DATABASE_URL`, which is required.

use std::env;
use std::str::FromStr;

use tracing::Level;
use tutoring_core::config::{BookingSettings, OutboxSettings};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// How the outbox worker runs: one relay cycle and exit, or poll forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    Once,
    Poll,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub log_level: Level,
    pub booking: BookingSettings,
    pub outbox: OutboxSettings,
    pub worker_mode: WorkerMode,
    pub poll_seconds: u64,
}

impl Config {
    /// Loads configuration from the environment, reading `.env` first if one
    /// is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level = parse_var("WORKER_LOG_LEVEL", Level::INFO)?;

        let booking = BookingSettings {
            hold_minutes: parse_var("BOOKING_HOLD_MINUTES", BookingSettings::default().hold_minutes)?,
            refund_window_hours: parse_var(
                "BOOKING_REFUND_WINDOW_HOURS",
                BookingSettings::default().refund_window_hours,
            )?,
        };

        let outbox_defaults = OutboxSettings::default();
        let outbox = OutboxSettings {
            batch_size: parse_var("OUTBOX_BATCH_SIZE", outbox_defaults.batch_size)?,
            max_retries: parse_var("OUTBOX_MAX_RETRIES", outbox_defaults.max_retries)?,
            base_backoff_seconds: parse_var(
                "OUTBOX_BASE_BACKOFF_SECONDS",
                outbox_defaults.base_backoff_seconds,
            )?,
            max_backoff_seconds: parse_var(
                "OUTBOX_MAX_BACKOFF_SECONDS",
                outbox_defaults.max_backoff_seconds,
            )?,
        };

        let worker_mode = match env::var("WORKER_MODE").as_deref() {
            Ok("once") | Err(_) => WorkerMode::Once,
            Ok("poll") => WorkerMode::Poll,
            Ok(other) => {
                return Err(ConfigError::InvalidValue(
                    "WORKER_MODE".to_string(),
                    other.to_string(),
                ))
            }
        };

        let poll_seconds = parse_var("WORKER_POLL_SECONDS", 10)?;

        Ok(Self {
            database_url,
            log_level,
            booking,
            outbox,
            worker_mode,
            poll_seconds,
        })
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(default),
    }
}
