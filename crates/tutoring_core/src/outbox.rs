//! crates/tutoring_core/src/outbox.rs
//!
//! The outbox relay: polls pending events, projects them into notification
//! rows, and retries failed events with exponential backoff until the retry
//! budget is exhausted (dead letter). Delivery is at-least-once; the booking
//! side never waits on the relay.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OutboxSettings;
use crate::domain::{NotificationStatus, OutboxEvent};
use crate::ports::{
    BillingRepository, Clock, DomainError, DomainResult, NotificationRepository, OutboxRepository,
};

/// Counters for one relay cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub requeued: usize,
    pub processed: usize,
    pub failed: usize,
    pub dispatched: usize,
}

/// One notification to be persisted for a recipient.
#[derive(Debug, Clone)]
struct NotificationMessage {
    user_id: Uuid,
    title: String,
    body: String,
}

const CHANNEL_EMAIL: &str = "email";

/// Whether a failed event's backoff window has elapsed. Stateless and
/// re-entrant; re-evaluated every cycle instead of arming a timer.
pub fn backoff_elapsed(
    retries: i32,
    last_attempt_at: DateTime<Utc>,
    now: DateTime<Utc>,
    settings: &OutboxSettings,
) -> bool {
    let exponent = u32::try_from(retries.max(1) - 1).unwrap_or(0);
    let backoff_seconds = settings
        .base_backoff_seconds
        .saturating_mul(2_i64.saturating_pow(exponent))
        .min(settings.max_backoff_seconds);
    now >= last_attempt_at + Duration::seconds(backoff_seconds)
}

pub struct OutboxRelay {
    outbox: Arc<dyn OutboxRepository>,
    notifications: Arc<dyn NotificationRepository>,
    billing: Arc<dyn BillingRepository>,
    clock: Arc<dyn Clock>,
    settings: OutboxSettings,
}

impl OutboxRelay {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        notifications: Arc<dyn NotificationRepository>,
        billing: Arc<dyn BillingRepository>,
        clock: Arc<dyn Clock>,
        settings: OutboxSettings,
    ) -> Self {
        Self {
            outbox,
            notifications,
            billing,
            clock,
            settings,
        }
    }

    /// Runs one relay cycle: requeue retryable failures whose backoff has
    /// elapsed, then dispatch up to `batch_size` pending events oldest
    /// first. A bad event is marked failed and left for a later cycle; it
    /// never aborts the batch.
    pub async fn run_once(&self) -> DomainResult<RelayStats> {
        let mut stats = RelayStats::default();
        stats.requeued = self.requeue_retryable_failed().await?;

        let events = self.outbox.list_pending(self.settings.batch_size).await?;
        for event in events {
            match self.dispatch_event(&event).await {
                Ok(dispatched) => {
                    self.outbox
                        .mark_processed(event.id, self.clock.now())
                        .await?;
                    stats.processed += 1;
                    stats.dispatched += dispatched;
                }
                Err(error) => {
                    warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        %error,
                        "outbox event dispatch failed"
                    );
                    self.outbox
                        .mark_failed(event.id, &error.to_string(), self.clock.now())
                        .await?;
                    stats.failed += 1;
                }
            }
        }

        info!(
            requeued = stats.requeued,
            processed = stats.processed,
            failed = stats.failed,
            dispatched = stats.dispatched,
            "outbox relay cycle complete"
        );
        Ok(stats)
    }

    async fn requeue_retryable_failed(&self) -> DomainResult<usize> {
        let now = self.clock.now();
        let failed = self
            .outbox
            .list_retryable_failed(self.settings.batch_size, self.settings.max_retries)
            .await?;
        let mut requeued = 0;
        for event in failed {
            let last_attempt = event.updated_at.unwrap_or(event.occurred_at);
            if backoff_elapsed(event.retries, last_attempt, now, &self.settings) {
                self.outbox.mark_pending(event.id, now).await?;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// Builds the full message list for the event, then persists each
    /// message. A translation failure aborts before any notification is
    /// written, so an event is never partially dispatched.
    async fn dispatch_event(&self, event: &OutboxEvent) -> DomainResult<usize> {
        let messages = self.build_messages(event).await?;
        let sent_at = self.clock.now();
        for message in &messages {
            let notification = self
                .notifications
                .create_notification(
                    message.user_id,
                    CHANNEL_EMAIL,
                    &message.title,
                    &message.body,
                )
                .await?;
            self.notifications
                .set_notification_status(notification.id, NotificationStatus::Sent, Some(sent_at))
                .await?;
        }
        Ok(messages.len())
    }

    async fn build_messages(&self, event: &OutboxEvent) -> DomainResult<Vec<NotificationMessage>> {
        let payload = &event.payload;

        match event.event_type.as_str() {
            "booking.confirmed" => {
                let student_id = required_uuid(payload, "student_id")?;
                let booking_id = payload_str(payload, "booking_id");
                Ok(vec![NotificationMessage {
                    user_id: student_id,
                    title: "Booking confirmed".to_string(),
                    body: format!("Your booking {booking_id} has been confirmed."),
                }])
            }
            "booking.canceled" => {
                let student_id = required_uuid(payload, "student_id")?;
                let booking_id = payload_str(payload, "booking_id");
                Ok(vec![NotificationMessage {
                    user_id: student_id,
                    title: "Booking canceled".to_string(),
                    body: format!("Your booking {booking_id} has been canceled."),
                }])
            }
            "booking.rescheduled" => {
                let student_id = required_uuid(payload, "student_id")?;
                let new_booking_id = payload_str(payload, "new_booking_id");
                let old_booking_id = payload_str(payload, "old_booking_id");
                Ok(vec![NotificationMessage {
                    user_id: student_id,
                    title: "Booking rescheduled".to_string(),
                    body: format!("Booking moved from {old_booking_id} to {new_booking_id}."),
                }])
            }
            event_type @ ("lesson.created" | "lesson.canceled") => {
                let title = if event_type == "lesson.created" {
                    "Lesson scheduled"
                } else {
                    "Lesson canceled"
                };
                let lesson_id = payload_str(payload, "lesson_id");
                let recipients = unique_recipients(&[
                    optional_uuid(payload, "student_id"),
                    optional_uuid(payload, "teacher_id"),
                ]);
                Ok(recipients
                    .into_iter()
                    .map(|user_id| NotificationMessage {
                        user_id,
                        title: title.to_string(),
                        body: format!("Lesson {lesson_id} status was updated."),
                    })
                    .collect())
            }
            "billing.package.created" => {
                let student_id = required_uuid(payload, "student_id")?;
                let package_id = payload_str(payload, "package_id");
                Ok(vec![NotificationMessage {
                    user_id: student_id,
                    title: "Package created".to_string(),
                    body: format!("Your package {package_id} is active."),
                }])
            }
            "billing.package.expired" => {
                let student_id = required_uuid(payload, "student_id")?;
                let package_id = payload_str(payload, "package_id");
                Ok(vec![NotificationMessage {
                    user_id: student_id,
                    title: "Package expired".to_string(),
                    body: format!("Your package {package_id} has expired."),
                }])
            }
            "billing.payment.status.updated" => {
                let payment_id = required_uuid(payload, "payment_id")?;
                let student_id = self
                    .billing
                    .get_payment_student_id(payment_id)
                    .await?
                    .ok_or_else(|| {
                        DomainError::Unexpected(format!(
                            "Student not found for payment {payment_id}"
                        ))
                    })?;
                let to_status = payload_str(payload, "to_status");
                Ok(vec![NotificationMessage {
                    user_id: student_id,
                    title: "Payment status changed".to_string(),
                    body: format!("Payment {payment_id} status is now {to_status}."),
                }])
            }
            // Unmatched event types dispatch nothing and are still marked
            // processed.
            _ => Ok(Vec::new()),
        }
    }
}

fn required_uuid(payload: &Value, key: &str) -> DomainResult<Uuid> {
    let value = payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| DomainError::Unexpected(format!("Missing required key: {key}")))?;
    Uuid::parse_str(value)
        .map_err(|_| DomainError::Unexpected(format!("Invalid UUID for key: {key}")))
}

fn optional_uuid(payload: &Value, key: &str) -> Option<Uuid> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .and_then(|value| Uuid::parse_str(value).ok())
}

fn payload_str(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn unique_recipients(candidates: &[Option<Uuid>]) -> Vec<Uuid> {
    let mut unique = Vec::new();
    for candidate in candidates.iter().flatten() {
        if !unique.contains(candidate) {
            unique.push(*candidate);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OutboxStatus, PaymentStatus};
    use crate::memory::{InMemoryStore, ManualClock};
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        relay: OutboxRelay,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_settings(OutboxSettings::default())
        }

        fn with_settings(settings: OutboxSettings) -> Self {
            let store = Arc::new(InMemoryStore::new());
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let relay = OutboxRelay::new(
                store.clone(),
                store.clone(),
                store.clone(),
                clock.clone(),
                settings,
            );
            Self {
                store,
                clock,
                relay,
            }
        }

        async fn append(&self, event_type: &str, payload: Value) -> OutboxEvent {
            self.store
                .append_event("test", "test", event_type, payload, self.clock.now())
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn booking_confirmed_is_dispatched_to_student() {
        let fx = Fixture::new();
        let student_id = Uuid::new_v4();
        let event = fx
            .append(
                "booking.confirmed",
                json!({
                    "student_id": student_id.to_string(),
                    "booking_id": Uuid::new_v4().to_string(),
                }),
            )
            .await;

        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(
            stats,
            RelayStats {
                requeued: 0,
                processed: 1,
                failed: 0,
                dispatched: 1,
            }
        );

        let stored = fx.store.event(event.id);
        assert_eq!(stored.status, OutboxStatus::Processed);
        assert!(stored.processed_at.is_some());

        let notifications = fx.store.notifications_for(student_id);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].title, "Booking confirmed");
        assert_eq!(notifications[0].status, NotificationStatus::Sent);
        assert!(notifications[0].sent_at.is_some());
    }

    #[tokio::test]
    async fn missing_required_key_fails_event_without_notifications() {
        let fx = Fixture::new();
        let event = fx.append("booking.confirmed", json!({})).await;

        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dispatched, 0);

        let stored = fx.store.event(event.id);
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.retries, 1);
        assert!(stored
            .error_message
            .as_deref()
            .unwrap()
            .contains("student_id"));
        assert!(fx.store.all_notifications().is_empty());
    }

    #[tokio::test]
    async fn unknown_event_type_is_processed_with_zero_messages() {
        let fx = Fixture::new();
        let event = fx.append("teacher.profile.updated", json!({})).await;

        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.dispatched, 0);
        assert_eq!(fx.store.event(event.id).status, OutboxStatus::Processed);
    }

    #[tokio::test]
    async fn lesson_events_fan_out_to_deduplicated_recipients() {
        let fx = Fixture::new();
        let student_id = Uuid::new_v4();
        let teacher_id = Uuid::new_v4();
        fx.append(
            "lesson.created",
            json!({
                "lesson_id": Uuid::new_v4().to_string(),
                "student_id": student_id.to_string(),
                "teacher_id": teacher_id.to_string(),
            }),
        )
        .await;
        // Degenerate payload where both recipients are the same user.
        fx.append(
            "lesson.canceled",
            json!({
                "lesson_id": Uuid::new_v4().to_string(),
                "student_id": student_id.to_string(),
                "teacher_id": student_id.to_string(),
            }),
        )
        .await;

        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.dispatched, 3);
        assert_eq!(fx.store.notifications_for(student_id).len(), 2);
        assert_eq!(fx.store.notifications_for(teacher_id).len(), 1);
    }

    #[tokio::test]
    async fn payment_status_event_resolves_student_through_package() {
        let fx = Fixture::new();
        let student_id = Uuid::new_v4();
        let package = fx
            .store
            .create_package(student_id, 5, fx.clock.now() + Duration::days(30))
            .await
            .unwrap();
        let payment = fx
            .store
            .create_payment(package.id, 5_000, "USD", None)
            .await
            .unwrap();
        fx.append(
            "billing.payment.status.updated",
            json!({
                "payment_id": payment.id.to_string(),
                "from_status": PaymentStatus::Pending.as_str(),
                "to_status": PaymentStatus::Succeeded.as_str(),
            }),
        )
        .await;

        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(stats.processed, 1);
        let notifications = fx.store.notifications_for(student_id);
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].body.contains("succeeded"));
    }

    #[tokio::test]
    async fn unresolvable_payment_student_fails_the_event() {
        let fx = Fixture::new();
        let event = fx
            .append(
                "billing.payment.status.updated",
                json!({ "payment_id": Uuid::new_v4().to_string() }),
            )
            .await;

        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(fx.store.event(event.id).status, OutboxStatus::Failed);
        assert!(fx.store.all_notifications().is_empty());
    }

    #[tokio::test]
    async fn failed_event_waits_for_backoff_then_retries() {
        let fx = Fixture::new();
        let event = fx.append("booking.confirmed", json!({})).await;

        fx.relay.run_once().await.unwrap();
        assert_eq!(fx.store.event(event.id).retries, 1);

        // Backoff for retries=1 is base_backoff_seconds; an immediate cycle
        // must not requeue the event.
        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(stats.requeued, 0);
        assert_eq!(fx.store.event(event.id).status, OutboxStatus::Failed);

        fx.clock.advance(Duration::seconds(30));
        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(stats.requeued, 1);
        // The requeued event was dispatched again this cycle and failed
        // again, bumping the retry counter.
        assert_eq!(stats.failed, 1);
        assert_eq!(fx.store.event(event.id).retries, 2);

        // Second retry backs off for base * 2 seconds.
        fx.clock.advance(Duration::seconds(59));
        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(stats.requeued, 0);
        fx.clock.advance(Duration::seconds(1));
        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(stats.requeued, 1);
    }

    #[tokio::test]
    async fn backoff_is_exponential_with_ceiling() {
        let settings = OutboxSettings::default();
        let start = Utc::now();

        assert!(!backoff_elapsed(1, start, start + Duration::seconds(29), &settings));
        assert!(backoff_elapsed(1, start, start + Duration::seconds(30), &settings));
        assert!(!backoff_elapsed(3, start, start + Duration::seconds(119), &settings));
        assert!(backoff_elapsed(3, start, start + Duration::seconds(120), &settings));
        // retries=5 would be 480s unclamped; the ceiling caps it at 300s.
        assert!(backoff_elapsed(5, start, start + Duration::seconds(300), &settings));
        assert!(!backoff_elapsed(5, start, start + Duration::seconds(299), &settings));
        // A zero retry count is treated as one attempt.
        assert!(backoff_elapsed(0, start, start + Duration::seconds(30), &settings));
    }

    #[tokio::test]
    async fn dead_letter_events_are_never_requeued() {
        let fx = Fixture::with_settings(OutboxSettings {
            max_retries: 2,
            ..OutboxSettings::default()
        });
        let event = fx.append("booking.confirmed", json!({})).await;

        for _ in 0..2 {
            fx.relay.run_once().await.unwrap();
            fx.clock.advance(Duration::seconds(600));
        }
        assert_eq!(fx.store.event(event.id).retries, 2);

        // Retry budget exhausted: even after a long wait nothing moves.
        fx.clock.advance(Duration::days(1));
        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(stats.requeued, 0);
        assert_eq!(stats.processed, 0);
        assert_eq!(fx.store.event(event.id).status, OutboxStatus::Failed);
    }

    #[tokio::test]
    async fn dispatch_is_fifo_and_bounded_by_batch_size() {
        let fx = Fixture::with_settings(OutboxSettings {
            batch_size: 2,
            ..OutboxSettings::default()
        });
        let student_id = Uuid::new_v4();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let event = fx
                .append(
                    "booking.confirmed",
                    json!({ "student_id": student_id.to_string() }),
                )
                .await;
            ids.push(event.id);
            fx.clock.advance(Duration::seconds(1));
        }

        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(fx.store.event(ids[0]).status, OutboxStatus::Processed);
        assert_eq!(fx.store.event(ids[1]).status, OutboxStatus::Processed);
        assert_eq!(fx.store.event(ids[2]).status, OutboxStatus::Pending);

        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(fx.store.event(ids[2]).status, OutboxStatus::Processed);
    }

    #[tokio::test]
    async fn one_bad_event_does_not_abort_the_batch() {
        let fx = Fixture::new();
        let student_id = Uuid::new_v4();
        fx.append("booking.confirmed", json!({})).await;
        fx.clock.advance(Duration::seconds(1));
        fx.append(
            "booking.canceled",
            json!({ "student_id": student_id.to_string() }),
        )
        .await;

        let stats = fx.relay.run_once().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(fx.store.notifications_for(student_id).len(), 1);
    }
}
