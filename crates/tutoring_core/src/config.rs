//! crates/tutoring_core/src/config.rs
//!
//! Explicitly constructed settings passed to the service constructors.
//! There is no ambient/global configuration lookup in the core.

/// Settings for the booking state machine.
#[derive(Debug, Clone, Copy)]
pub struct BookingSettings {
    /// How long a hold reserves a slot before it can be expired.
    pub hold_minutes: i64,
    /// Canceling a confirmed booking more than this many hours before the
    /// slot start returns the lesson to the package.
    pub refund_window_hours: i64,
}

impl Default for BookingSettings {
    fn default() -> Self {
        Self {
            hold_minutes: 10,
            refund_window_hours: 24,
        }
    }
}

/// Settings for the outbox relay.
#[derive(Debug, Clone, Copy)]
pub struct OutboxSettings {
    /// Maximum pending events dispatched per cycle.
    pub batch_size: i64,
    /// Retry budget before an event becomes a dead letter.
    pub max_retries: i32,
    pub base_backoff_seconds: i64,
    pub max_backoff_seconds: i64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 5,
            base_backoff_seconds: 30,
            max_backoff_seconds: 300,
        }
    }
}
