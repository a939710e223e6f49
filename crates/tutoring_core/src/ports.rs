//! crates/tutoring_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{
    AvailabilitySlot, Booking, Lesson, LessonPackage, LessonStatus, Notification,
    NotificationStatus, OutboxEvent, PackageStatus, Payment, PaymentStatus, SlotStatus,
};

//=========================================================================================
// Domain Error and Result Types
//=========================================================================================

/// The error taxonomy shared by ports and services. The surrounding HTTP
/// layer maps each kind to a stable status family; the core only signals the
/// kind.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Unauthorized(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Business rule violated: {0}")]
    BusinessRule(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, DomainError>`.
pub type DomainResult<T> = Result<T, DomainError>;

//=========================================================================================
// Clock
//=========================================================================================

/// Supplies the current instant. Injectable so the state machine and the
/// relay are deterministic under test. All timestamps are UTC-aware.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The production clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

//=========================================================================================
// Repository Ports (Traits)
//=========================================================================================

/// Availability slot persistence. Slot status is only ever written through
/// the booking state machine once a booking exists for the slot.
#[async_trait]
pub trait SchedulingRepository: Send + Sync {
    async fn create_slot(
        &self,
        teacher_id: Uuid,
        created_by_admin_id: Uuid,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> DomainResult<AvailabilitySlot>;

    async fn get_slot_by_id(&self, slot_id: Uuid) -> DomainResult<Option<AvailabilitySlot>>;

    async fn set_slot_status(&self, slot_id: Uuid, status: SlotStatus) -> DomainResult<()>;
}

/// Lesson package and payment persistence. Balance is only mutated through
/// `consume_package_lesson` / `return_package_lesson`, which keep
/// `0 <= lessons_left <= lessons_total`.
#[async_trait]
pub trait BillingRepository: Send + Sync {
    async fn create_package(
        &self,
        student_id: Uuid,
        lessons_total: i32,
        expires_at: DateTime<Utc>,
    ) -> DomainResult<LessonPackage>;

    async fn get_package_by_id(&self, package_id: Uuid) -> DomainResult<Option<LessonPackage>>;

    /// Decrements `lessons_left` by one. Fails with a business-rule error if
    /// the balance is already zero.
    async fn consume_package_lesson(&self, package_id: Uuid) -> DomainResult<()>;

    /// Increments `lessons_left` by one, capped at `lessons_total`.
    async fn return_package_lesson(&self, package_id: Uuid) -> DomainResult<()>;

    async fn set_package_status(
        &self,
        package_id: Uuid,
        status: PackageStatus,
    ) -> DomainResult<()>;

    async fn find_packages_to_expire(
        &self,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<LessonPackage>>;

    async fn create_payment(
        &self,
        package_id: Uuid,
        amount_cents: i64,
        currency: &str,
        external_reference: Option<&str>,
    ) -> DomainResult<Payment>;

    async fn get_payment_by_id(&self, payment_id: Uuid) -> DomainResult<Option<Payment>>;

    async fn set_payment_status(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> DomainResult<()>;

    /// Resolves the owning student of a payment through its package.
    async fn get_payment_student_id(&self, payment_id: Uuid) -> DomainResult<Option<Uuid>>;
}

/// Booking persistence. `create_booking_hold` fails with a conflict when the
/// slot already has a booking in a non-terminal state (the uniqueness guard
/// against two students racing on one slot).
#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn create_booking_hold(
        &self,
        slot_id: Uuid,
        student_id: Uuid,
        teacher_id: Uuid,
        package_id: Uuid,
        hold_expires_at: DateTime<Utc>,
    ) -> DomainResult<Booking>;

    async fn get_booking_by_id(&self, booking_id: Uuid) -> DomainResult<Option<Booking>>;

    async fn find_expired_holds(&self, now: DateTime<Utc>) -> DomainResult<Vec<Booking>>;

    /// Persists the given booking record as-is, keyed by its id.
    async fn update_booking(&self, booking: &Booking) -> DomainResult<()>;
}

/// Derived lesson persistence.
#[async_trait]
pub trait LessonRepository: Send + Sync {
    async fn create_lesson(
        &self,
        booking_id: Uuid,
        student_id: Uuid,
        teacher_id: Uuid,
        scheduled_start_at: DateTime<Utc>,
        scheduled_end_at: DateTime<Utc>,
    ) -> DomainResult<Lesson>;

    async fn get_lesson_by_booking_id(&self, booking_id: Uuid) -> DomainResult<Option<Lesson>>;

    async fn set_lesson_status(&self, lesson_id: Uuid, status: LessonStatus) -> DomainResult<()>;
}

/// Transactional outbox persistence. `append_event` must run inside the same
/// transaction as the domain mutation it describes.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    async fn append_event(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
        payload: Value,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<OutboxEvent>;

    /// Pending events ordered by `occurred_at` ascending (FIFO).
    async fn list_pending(&self, limit: i64) -> DomainResult<Vec<OutboxEvent>>;

    /// Failed events still within the retry budget.
    async fn list_retryable_failed(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> DomainResult<Vec<OutboxEvent>>;

    /// Resets a failed event to pending, clearing its error message.
    async fn mark_pending(&self, event_id: Uuid, at: DateTime<Utc>) -> DomainResult<()>;

    async fn mark_processed(&self, event_id: Uuid, at: DateTime<Utc>) -> DomainResult<()>;

    /// Marks the event failed, increments its retry counter and records the
    /// error message.
    async fn mark_failed(
        &self,
        event_id: Uuid,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> DomainResult<()>;
}

/// Notification persistence, written only by the outbox relay.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create_notification(
        &self,
        user_id: Uuid,
        channel: &str,
        title: &str,
        body: &str,
    ) -> DomainResult<Notification>;

    async fn set_notification_status(
        &self,
        notification_id: Uuid,
        status: NotificationStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> DomainResult<()>;
}
