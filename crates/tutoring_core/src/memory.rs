//! crates/tutoring_core/src/memory.rs
//!
//! HashMap-backed implementations of the repository ports, for tests and
//! local development. One store implements every port so a single instance
//! stands in for the shared transactional session; it enforces the same
//! guards the database schema does (one active booking per slot, balance
//! bounds), so the services are exercised against equivalent semantics.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{
    AvailabilitySlot, Booking, BookingStatus, Lesson, LessonPackage, LessonStatus, Notification,
    NotificationStatus, OutboxEvent, OutboxStatus, PackageStatus, Payment, PaymentStatus,
    SlotStatus,
};
use crate::ports::{
    BillingRepository, BookingRepository, Clock, DomainError, DomainResult, LessonRepository,
    NotificationRepository, OutboxRepository, SchedulingRepository,
};

/// A clock that only moves when told to. Deterministic time for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

#[derive(Default)]
struct Tables {
    slots: HashMap<Uuid, AvailabilitySlot>,
    packages: HashMap<Uuid, LessonPackage>,
    bookings: HashMap<Uuid, Booking>,
    lessons: HashMap<Uuid, Lesson>,
    payments: HashMap<Uuid, Payment>,
    events: Vec<OutboxEvent>,
    notifications: Vec<Notification>,
}

/// In-memory store implementing all repository ports.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> DomainResult<T>) -> DomainResult<T> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| DomainError::Unexpected("store lock poisoned".to_string()))?;
        f(&mut tables)
    }
}

#[async_trait]
impl SchedulingRepository for InMemoryStore {
    async fn create_slot(
        &self,
        teacher_id: Uuid,
        created_by_admin_id: Uuid,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> DomainResult<AvailabilitySlot> {
        let slot = AvailabilitySlot {
            id: Uuid::new_v4(),
            teacher_id,
            created_by_admin_id,
            start_at,
            end_at,
            status: SlotStatus::Open,
        };
        self.with_tables(|tables| {
            tables.slots.insert(slot.id, slot.clone());
            Ok(slot)
        })
    }

    async fn get_slot_by_id(&self, slot_id: Uuid) -> DomainResult<Option<AvailabilitySlot>> {
        self.with_tables(|tables| Ok(tables.slots.get(&slot_id).cloned()))
    }

    async fn set_slot_status(&self, slot_id: Uuid, status: SlotStatus) -> DomainResult<()> {
        self.with_tables(|tables| {
            let slot = tables
                .slots
                .get_mut(&slot_id)
                .ok_or_else(|| DomainError::NotFound("Slot not found".to_string()))?;
            slot.status = status;
            Ok(())
        })
    }
}

#[async_trait]
impl BillingRepository for InMemoryStore {
    async fn create_package(
        &self,
        student_id: Uuid,
        lessons_total: i32,
        expires_at: DateTime<Utc>,
    ) -> DomainResult<LessonPackage> {
        let package = LessonPackage {
            id: Uuid::new_v4(),
            student_id,
            lessons_total,
            lessons_left: lessons_total,
            expires_at,
            status: PackageStatus::Active,
        };
        self.with_tables(|tables| {
            tables.packages.insert(package.id, package.clone());
            Ok(package)
        })
    }

    async fn get_package_by_id(&self, package_id: Uuid) -> DomainResult<Option<LessonPackage>> {
        self.with_tables(|tables| Ok(tables.packages.get(&package_id).cloned()))
    }

    async fn consume_package_lesson(&self, package_id: Uuid) -> DomainResult<()> {
        self.with_tables(|tables| {
            let package = tables
                .packages
                .get_mut(&package_id)
                .ok_or_else(|| DomainError::NotFound("Package not found".to_string()))?;
            if package.lessons_left <= 0 {
                return Err(DomainError::BusinessRule("No lessons left".to_string()));
            }
            package.lessons_left -= 1;
            Ok(())
        })
    }

    async fn return_package_lesson(&self, package_id: Uuid) -> DomainResult<()> {
        self.with_tables(|tables| {
            let package = tables
                .packages
                .get_mut(&package_id)
                .ok_or_else(|| DomainError::NotFound("Package not found".to_string()))?;
            package.lessons_left = (package.lessons_left + 1).min(package.lessons_total);
            Ok(())
        })
    }

    async fn set_package_status(
        &self,
        package_id: Uuid,
        status: PackageStatus,
    ) -> DomainResult<()> {
        self.with_tables(|tables| {
            let package = tables
                .packages
                .get_mut(&package_id)
                .ok_or_else(|| DomainError::NotFound("Package not found".to_string()))?;
            package.status = status;
            Ok(())
        })
    }

    async fn find_packages_to_expire(
        &self,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<LessonPackage>> {
        self.with_tables(|tables| {
            Ok(tables
                .packages
                .values()
                .filter(|package| {
                    package.status == PackageStatus::Active && package.expires_at <= now
                })
                .cloned()
                .collect())
        })
    }

    async fn create_payment(
        &self,
        package_id: Uuid,
        amount_cents: i64,
        currency: &str,
        external_reference: Option<&str>,
    ) -> DomainResult<Payment> {
        let payment = Payment {
            id: Uuid::new_v4(),
            package_id,
            amount_cents,
            currency: currency.to_string(),
            external_reference: external_reference.map(str::to_string),
            status: PaymentStatus::Pending,
            paid_at: None,
        };
        self.with_tables(|tables| {
            tables.payments.insert(payment.id, payment.clone());
            Ok(payment)
        })
    }

    async fn get_payment_by_id(&self, payment_id: Uuid) -> DomainResult<Option<Payment>> {
        self.with_tables(|tables| Ok(tables.payments.get(&payment_id).cloned()))
    }

    async fn set_payment_status(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> DomainResult<()> {
        self.with_tables(|tables| {
            let payment = tables
                .payments
                .get_mut(&payment_id)
                .ok_or_else(|| DomainError::NotFound("Payment not found".to_string()))?;
            payment.status = status;
            payment.paid_at = paid_at;
            Ok(())
        })
    }

    async fn get_payment_student_id(&self, payment_id: Uuid) -> DomainResult<Option<Uuid>> {
        self.with_tables(|tables| {
            Ok(tables.payments.get(&payment_id).and_then(|payment| {
                tables
                    .packages
                    .get(&payment.package_id)
                    .map(|package| package.student_id)
            }))
        })
    }
}

#[async_trait]
impl BookingRepository for InMemoryStore {
    async fn create_booking_hold(
        &self,
        slot_id: Uuid,
        student_id: Uuid,
        teacher_id: Uuid,
        package_id: Uuid,
        hold_expires_at: DateTime<Utc>,
    ) -> DomainResult<Booking> {
        self.with_tables(|tables| {
            let occupied = tables.bookings.values().any(|booking| {
                booking.slot_id == slot_id
                    && matches!(
                        booking.status,
                        BookingStatus::Hold | BookingStatus::Confirmed
                    )
            });
            if occupied {
                return Err(DomainError::Conflict(
                    "Slot already has an active booking".to_string(),
                ));
            }

            let booking = Booking {
                id: Uuid::new_v4(),
                slot_id,
                student_id,
                teacher_id,
                package_id: Some(package_id),
                status: BookingStatus::Hold,
                hold_expires_at: Some(hold_expires_at),
                confirmed_at: None,
                canceled_at: None,
                cancellation_reason: None,
                refund_returned: false,
                rescheduled_from_booking_id: None,
            };
            tables.bookings.insert(booking.id, booking.clone());
            Ok(booking)
        })
    }

    async fn get_booking_by_id(&self, booking_id: Uuid) -> DomainResult<Option<Booking>> {
        self.with_tables(|tables| Ok(tables.bookings.get(&booking_id).cloned()))
    }

    async fn find_expired_holds(&self, now: DateTime<Utc>) -> DomainResult<Vec<Booking>> {
        self.with_tables(|tables| {
            Ok(tables
                .bookings
                .values()
                .filter(|booking| {
                    booking.status == BookingStatus::Hold
                        && booking
                            .hold_expires_at
                            .map_or(false, |expires| expires <= now)
                })
                .cloned()
                .collect())
        })
    }

    async fn update_booking(&self, booking: &Booking) -> DomainResult<()> {
        self.with_tables(|tables| {
            if !tables.bookings.contains_key(&booking.id) {
                return Err(DomainError::NotFound("Booking not found".to_string()));
            }
            tables.bookings.insert(booking.id, booking.clone());
            Ok(())
        })
    }
}

#[async_trait]
impl LessonRepository for InMemoryStore {
    async fn create_lesson(
        &self,
        booking_id: Uuid,
        student_id: Uuid,
        teacher_id: Uuid,
        scheduled_start_at: DateTime<Utc>,
        scheduled_end_at: DateTime<Utc>,
    ) -> DomainResult<Lesson> {
        let lesson = Lesson {
            id: Uuid::new_v4(),
            booking_id,
            student_id,
            teacher_id,
            scheduled_start_at,
            scheduled_end_at,
            status: LessonStatus::Scheduled,
        };
        self.with_tables(|tables| {
            tables.lessons.insert(lesson.id, lesson.clone());
            Ok(lesson)
        })
    }

    async fn get_lesson_by_booking_id(&self, booking_id: Uuid) -> DomainResult<Option<Lesson>> {
        self.with_tables(|tables| {
            Ok(tables
                .lessons
                .values()
                .find(|lesson| lesson.booking_id == booking_id)
                .cloned())
        })
    }

    async fn set_lesson_status(&self, lesson_id: Uuid, status: LessonStatus) -> DomainResult<()> {
        self.with_tables(|tables| {
            let lesson = tables
                .lessons
                .get_mut(&lesson_id)
                .ok_or_else(|| DomainError::NotFound("Lesson not found".to_string()))?;
            lesson.status = status;
            Ok(())
        })
    }
}

#[async_trait]
impl OutboxRepository for InMemoryStore {
    async fn append_event(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
        payload: Value,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<OutboxEvent> {
        let event = OutboxEvent {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            status: OutboxStatus::Pending,
            retries: 0,
            error_message: None,
            occurred_at,
            updated_at: None,
            processed_at: None,
        };
        self.with_tables(|tables| {
            tables.events.push(event.clone());
            Ok(event)
        })
    }

    async fn list_pending(&self, limit: i64) -> DomainResult<Vec<OutboxEvent>> {
        self.with_tables(|tables| {
            let mut pending: Vec<OutboxEvent> = tables
                .events
                .iter()
                .filter(|event| event.status == OutboxStatus::Pending)
                .cloned()
                .collect();
            pending.sort_by_key(|event| event.occurred_at);
            pending.truncate(limit.max(0) as usize);
            Ok(pending)
        })
    }

    async fn list_retryable_failed(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> DomainResult<Vec<OutboxEvent>> {
        self.with_tables(|tables| {
            let mut failed: Vec<OutboxEvent> = tables
                .events
                .iter()
                .filter(|event| {
                    event.status == OutboxStatus::Failed && event.retries < max_retries
                })
                .cloned()
                .collect();
            failed.sort_by_key(|event| event.updated_at.unwrap_or(event.occurred_at));
            failed.truncate(limit.max(0) as usize);
            Ok(failed)
        })
    }

    async fn mark_pending(&self, event_id: Uuid, at: DateTime<Utc>) -> DomainResult<()> {
        self.update_event(event_id, |event| {
            event.status = OutboxStatus::Pending;
            event.error_message = None;
            event.processed_at = None;
            event.updated_at = Some(at);
        })
    }

    async fn mark_processed(&self, event_id: Uuid, at: DateTime<Utc>) -> DomainResult<()> {
        self.update_event(event_id, |event| {
            event.status = OutboxStatus::Processed;
            event.error_message = None;
            event.processed_at = Some(at);
            event.updated_at = Some(at);
        })
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.update_event(event_id, |event| {
            event.status = OutboxStatus::Failed;
            event.retries += 1;
            event.error_message = Some(error_message.to_string());
            event.processed_at = None;
            event.updated_at = Some(at);
        })
    }
}

impl InMemoryStore {
    fn update_event(&self, event_id: Uuid, f: impl FnOnce(&mut OutboxEvent)) -> DomainResult<()> {
        self.with_tables(|tables| {
            let event = tables
                .events
                .iter_mut()
                .find(|event| event.id == event_id)
                .ok_or_else(|| DomainError::NotFound("Outbox event not found".to_string()))?;
            f(event);
            Ok(())
        })
    }
}

#[async_trait]
impl NotificationRepository for InMemoryStore {
    async fn create_notification(
        &self,
        user_id: Uuid,
        channel: &str,
        title: &str,
        body: &str,
    ) -> DomainResult<Notification> {
        let notification = Notification {
            id: Uuid::new_v4(),
            user_id,
            channel: channel.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            status: NotificationStatus::Pending,
            sent_at: None,
        };
        self.with_tables(|tables| {
            tables.notifications.push(notification.clone());
            Ok(notification)
        })
    }

    async fn set_notification_status(
        &self,
        notification_id: Uuid,
        status: NotificationStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> DomainResult<()> {
        self.with_tables(|tables| {
            let notification = tables
                .notifications
                .iter_mut()
                .find(|notification| notification.id == notification_id)
                .ok_or_else(|| DomainError::NotFound("Notification not found".to_string()))?;
            notification.status = status;
            notification.sent_at = sent_at;
            Ok(())
        })
    }
}

/// Direct state accessors for assertions in tests.
#[cfg(test)]
impl InMemoryStore {
    fn snapshot<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.lock().expect("store lock poisoned");
        f(&tables)
    }

    pub fn slot(&self, slot_id: Uuid) -> AvailabilitySlot {
        self.snapshot(|tables| tables.slots.get(&slot_id).cloned())
            .expect("slot missing")
    }

    pub fn package(&self, package_id: Uuid) -> LessonPackage {
        self.snapshot(|tables| tables.packages.get(&package_id).cloned())
            .expect("package missing")
    }

    pub fn booking(&self, booking_id: Uuid) -> Booking {
        self.snapshot(|tables| tables.bookings.get(&booking_id).cloned())
            .expect("booking missing")
    }

    pub fn event(&self, event_id: Uuid) -> OutboxEvent {
        self.snapshot(|tables| {
            tables
                .events
                .iter()
                .find(|event| event.id == event_id)
                .cloned()
        })
        .expect("event missing")
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<OutboxEvent> {
        self.snapshot(|tables| {
            tables
                .events
                .iter()
                .filter(|event| event.event_type == event_type)
                .cloned()
                .collect()
        })
    }

    pub fn notifications_for(&self, user_id: Uuid) -> Vec<Notification> {
        self.snapshot(|tables| {
            tables
                .notifications
                .iter()
                .filter(|notification| notification.user_id == user_id)
                .cloned()
                .collect()
        })
    }

    pub fn all_notifications(&self) -> Vec<Notification> {
        self.snapshot(|tables| tables.notifications.clone())
    }
}
