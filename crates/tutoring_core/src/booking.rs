//! crates/tutoring_core/src/booking.rs
//!
//! The booking lifecycle state machine: hold -> confirm / cancel /
//! reschedule, plus the expire-holds sweep. Every transition runs against
//! the caller-supplied transactional session and appends its outbox events
//! through the same session, so an event exists if and only if the mutation
//! it describes was committed.

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::config::BookingSettings;
use crate::domain::{
    Actor, AvailabilitySlot, Booking, BookingStatus, LessonPackage, LessonStatus, PackageStatus,
    Role, SlotStatus,
};
use crate::ports::{
    BillingRepository, BookingRepository, Clock, DomainError, DomainResult, LessonRepository,
    OutboxRepository, SchedulingRepository,
};

pub struct BookingService {
    bookings: Arc<dyn BookingRepository>,
    scheduling: Arc<dyn SchedulingRepository>,
    billing: Arc<dyn BillingRepository>,
    lessons: Arc<dyn LessonRepository>,
    outbox: Arc<dyn OutboxRepository>,
    clock: Arc<dyn Clock>,
    settings: BookingSettings,
}

impl BookingService {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        scheduling: Arc<dyn SchedulingRepository>,
        billing: Arc<dyn BillingRepository>,
        lessons: Arc<dyn LessonRepository>,
        outbox: Arc<dyn OutboxRepository>,
        clock: Arc<dyn Clock>,
        settings: BookingSettings,
    ) -> Self {
        Self {
            bookings,
            scheduling,
            billing,
            lessons,
            outbox,
            clock,
            settings,
        }
    }

    fn validate_actor_access(&self, booking: &Booking, actor: &Actor) -> DomainResult<()> {
        match actor.role {
            Role::Admin => Ok(()),
            Role::Student if booking.student_id == actor.id => Ok(()),
            Role::Teacher if booking.teacher_id == actor.id => Ok(()),
            _ => Err(DomainError::Unauthorized(
                "You cannot manage this booking".to_string(),
            )),
        }
    }

    async fn get_slot(&self, slot_id: Uuid) -> DomainResult<AvailabilitySlot> {
        self.scheduling
            .get_slot_by_id(slot_id)
            .await?
            .ok_or_else(|| DomainError::NotFound("Slot not found".to_string()))
    }

    /// Validates that the package can back a booking for the student. A
    /// stale `active` package is explicitly transitioned to `expired`, with
    /// the transition recorded on the outbox, before the check fails.
    async fn usable_package(
        &self,
        package_id: Uuid,
        student_id: Uuid,
    ) -> DomainResult<LessonPackage> {
        let package = self
            .billing
            .get_package_by_id(package_id)
            .await?
            .ok_or_else(|| DomainError::NotFound("Package not found".to_string()))?;
        if package.student_id != student_id {
            return Err(DomainError::Unauthorized(
                "Package does not belong to current student".to_string(),
            ));
        }

        if package.expires_at <= self.clock.now() {
            if package.status != PackageStatus::Expired {
                self.billing
                    .set_package_status(package.id, PackageStatus::Expired)
                    .await?;
                self.outbox
                    .append_event(
                        "billing",
                        &package.id.to_string(),
                        "billing.package.expired",
                        json!({
                            "package_id": package.id.to_string(),
                            "student_id": package.student_id.to_string(),
                        }),
                        self.clock.now(),
                    )
                    .await?;
            }
            return Err(DomainError::BusinessRule("Package is expired".to_string()));
        }

        if package.status != PackageStatus::Active {
            return Err(DomainError::BusinessRule(
                "Package is not active".to_string(),
            ));
        }
        if package.lessons_left <= 0 {
            return Err(DomainError::BusinessRule(
                "No lessons left in package".to_string(),
            ));
        }
        Ok(package)
    }

    /// Creates lesson for confirmed booking if it does not exist yet.
    async fn ensure_lesson_for_confirmed_booking(
        &self,
        booking: &Booking,
        slot: &AvailabilitySlot,
    ) -> DomainResult<()> {
        if self
            .lessons
            .get_lesson_by_booking_id(booking.id)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let lesson = self
            .lessons
            .create_lesson(
                booking.id,
                booking.student_id,
                booking.teacher_id,
                slot.start_at,
                slot.end_at,
            )
            .await?;
        self.outbox
            .append_event(
                "lesson",
                &lesson.id.to_string(),
                "lesson.created",
                json!({
                    "lesson_id": lesson.id.to_string(),
                    "booking_id": booking.id.to_string(),
                    "student_id": booking.student_id.to_string(),
                    "teacher_id": booking.teacher_id.to_string(),
                }),
                self.clock.now(),
            )
            .await?;
        Ok(())
    }

    /// Cancels the linked lesson if it exists and is not already canceled.
    async fn cancel_lesson_for_booking(
        &self,
        booking: &Booking,
        reason: Option<&str>,
    ) -> DomainResult<()> {
        let lesson = match self.lessons.get_lesson_by_booking_id(booking.id).await? {
            Some(lesson) if lesson.status != LessonStatus::Canceled => lesson,
            _ => return Ok(()),
        };

        self.lessons
            .set_lesson_status(lesson.id, LessonStatus::Canceled)
            .await?;
        self.outbox
            .append_event(
                "lesson",
                &lesson.id.to_string(),
                "lesson.canceled",
                json!({
                    "lesson_id": lesson.id.to_string(),
                    "booking_id": booking.id.to_string(),
                    "student_id": booking.student_id.to_string(),
                    "teacher_id": booking.teacher_id.to_string(),
                    "reason": reason,
                }),
                self.clock.now(),
            )
            .await?;
        Ok(())
    }

    /// Places a time-boxed hold on an open slot, backed by a package. The
    /// package balance is not touched here; it is only reserved implicitly
    /// by the slot hold.
    pub async fn hold_booking(
        &self,
        slot_id: Uuid,
        package_id: Uuid,
        actor: &Actor,
    ) -> DomainResult<Booking> {
        if actor.role != Role::Student {
            return Err(DomainError::Unauthorized(
                "Only students can hold bookings".to_string(),
            ));
        }

        let slot = self.get_slot(slot_id).await?;
        if slot.status != SlotStatus::Open {
            return Err(DomainError::BusinessRule(
                "Slot is not available".to_string(),
            ));
        }
        if slot.start_at <= self.clock.now() {
            return Err(DomainError::BusinessRule(
                "Cannot book a slot in the past".to_string(),
            ));
        }

        let package = self.usable_package(package_id, actor.id).await?;

        let hold_expires_at = self.clock.now() + Duration::minutes(self.settings.hold_minutes);
        self.scheduling
            .set_slot_status(slot.id, SlotStatus::Hold)
            .await?;
        let booking = self
            .bookings
            .create_booking_hold(slot.id, actor.id, slot.teacher_id, package.id, hold_expires_at)
            .await?;

        self.outbox
            .append_event(
                "booking",
                &booking.id.to_string(),
                "booking.hold.created",
                json!({
                    "booking_id": booking.id.to_string(),
                    "slot_id": slot.id.to_string(),
                    "student_id": actor.id.to_string(),
                }),
                self.clock.now(),
            )
            .await?;
        info!(booking_id = %booking.id, slot_id = %slot.id, "booking hold created");
        Ok(booking)
    }

    /// Confirms a held booking: consumes one lesson from the package, books
    /// the slot and materializes the derived lesson record. Confirming an
    /// already-lapsed hold expires it instead and fails.
    pub async fn confirm_booking(&self, booking_id: Uuid, actor: &Actor) -> DomainResult<Booking> {
        let mut booking = self
            .bookings
            .get_booking_by_id(booking_id)
            .await?
            .ok_or_else(|| DomainError::NotFound("Booking not found".to_string()))?;
        self.validate_actor_access(&booking, actor)?;

        if booking.status != BookingStatus::Hold {
            return Err(DomainError::Conflict(
                "Only HOLD booking can be confirmed".to_string(),
            ));
        }

        let now = self.clock.now();
        if booking.hold_expires_at.map_or(true, |expires| expires <= now) {
            booking.status = BookingStatus::Expired;
            self.scheduling
                .set_slot_status(booking.slot_id, SlotStatus::Open)
                .await?;
            self.bookings.update_booking(&booking).await?;
            return Err(DomainError::BusinessRule(
                "Booking hold has expired".to_string(),
            ));
        }

        let package_id = booking.package_id.ok_or_else(|| {
            DomainError::BusinessRule("Booking package is required".to_string())
        })?;
        let package = self.usable_package(package_id, booking.student_id).await?;
        self.billing.consume_package_lesson(package.id).await?;

        booking.status = BookingStatus::Confirmed;
        booking.confirmed_at = Some(now);
        booking.hold_expires_at = None;
        let slot = self.get_slot(booking.slot_id).await?;
        self.scheduling
            .set_slot_status(slot.id, SlotStatus::Booked)
            .await?;
        self.bookings.update_booking(&booking).await?;

        self.outbox
            .append_event(
                "booking",
                &booking.id.to_string(),
                "booking.confirmed",
                json!({
                    "booking_id": booking.id.to_string(),
                    "student_id": booking.student_id.to_string(),
                    "slot_id": booking.slot_id.to_string(),
                }),
                self.clock.now(),
            )
            .await?;
        self.ensure_lesson_for_confirmed_booking(&booking, &slot)
            .await?;
        info!(booking_id = %booking.id, "booking confirmed");
        Ok(booking)
    }

    /// Cancels a held or confirmed booking. A confirmed booking canceled
    /// more than the refund window before the slot start returns its lesson
    /// to the package; inside the window the lesson is forfeited.
    pub async fn cancel_booking(
        &self,
        booking_id: Uuid,
        reason: Option<String>,
        actor: &Actor,
    ) -> DomainResult<Booking> {
        let mut booking = self
            .bookings
            .get_booking_by_id(booking_id)
            .await?
            .ok_or_else(|| DomainError::NotFound("Booking not found".to_string()))?;
        self.validate_actor_access(&booking, actor)?;

        if matches!(
            booking.status,
            BookingStatus::Canceled | BookingStatus::Expired
        ) {
            return Err(DomainError::Conflict(
                "Booking already canceled or expired".to_string(),
            ));
        }

        let now = self.clock.now();
        let slot = self.get_slot(booking.slot_id).await?;
        let mut refund_returned = false;

        if booking.status == BookingStatus::Confirmed {
            if let Some(package_id) = booking.package_id {
                self.billing
                    .get_package_by_id(package_id)
                    .await?
                    .ok_or_else(|| DomainError::NotFound("Package not found".to_string()))?;
                let refund_window = Duration::hours(self.settings.refund_window_hours);
                if slot.start_at - now > refund_window {
                    self.billing.return_package_lesson(package_id).await?;
                    refund_returned = true;
                }
            }
        }

        booking.status = BookingStatus::Canceled;
        booking.canceled_at = Some(now);
        booking.cancellation_reason = reason.clone();
        booking.refund_returned = refund_returned;

        if slot.start_at > now {
            self.scheduling
                .set_slot_status(slot.id, SlotStatus::Open)
                .await?;
        }
        self.bookings.update_booking(&booking).await?;

        self.outbox
            .append_event(
                "booking",
                &booking.id.to_string(),
                "booking.canceled",
                json!({
                    "booking_id": booking.id.to_string(),
                    "student_id": booking.student_id.to_string(),
                    "slot_id": booking.slot_id.to_string(),
                    "refund_returned": refund_returned,
                }),
                self.clock.now(),
            )
            .await?;
        self.cancel_lesson_for_booking(&booking, reason.as_deref())
            .await?;
        info!(booking_id = %booking.id, refund_returned, "booking canceled");
        Ok(booking)
    }

    /// Reschedules a booking as cancel + hold + confirm against the new
    /// slot. The cancel-refund and confirm-consume effects compose; the new
    /// booking links back to the old one.
    pub async fn reschedule_booking(
        &self,
        booking_id: Uuid,
        new_slot_id: Uuid,
        actor: &Actor,
    ) -> DomainResult<Booking> {
        let old_booking = self
            .cancel_booking(booking_id, Some("Rescheduled by user".to_string()), actor)
            .await?;

        let package_id = old_booking.package_id.ok_or_else(|| {
            DomainError::BusinessRule("Booking has no package for reschedule".to_string())
        })?;

        let new_hold = self.hold_booking(new_slot_id, package_id, actor).await?;
        let mut new_booking = self.confirm_booking(new_hold.id, actor).await?;
        new_booking.rescheduled_from_booking_id = Some(old_booking.id);
        self.bookings.update_booking(&new_booking).await?;

        self.outbox
            .append_event(
                "booking",
                &new_booking.id.to_string(),
                "booking.rescheduled",
                json!({
                    "new_booking_id": new_booking.id.to_string(),
                    "old_booking_id": old_booking.id.to_string(),
                    "student_id": new_booking.student_id.to_string(),
                }),
                self.clock.now(),
            )
            .await?;
        info!(
            old_booking_id = %old_booking.id,
            new_booking_id = %new_booking.id,
            "booking rescheduled"
        );
        Ok(new_booking)
    }

    /// Expires stale holds and releases their slots (admin sweep). Bookings
    /// already transitioned out of `hold` are not selected, so the sweep is
    /// idempotent.
    pub async fn expire_holds(&self, actor: &Actor) -> DomainResult<usize> {
        if !actor.is_admin() {
            return Err(DomainError::Unauthorized(
                "Only admin can run hold expiration".to_string(),
            ));
        }

        let now = self.clock.now();
        let holds = self.bookings.find_expired_holds(now).await?;
        for booking in &holds {
            let mut booking = booking.clone();
            booking.status = BookingStatus::Expired;
            self.scheduling
                .set_slot_status(booking.slot_id, SlotStatus::Open)
                .await?;
            self.bookings.update_booking(&booking).await?;
            self.outbox
                .append_event(
                    "booking",
                    &booking.id.to_string(),
                    "booking.hold.expired",
                    json!({
                        "booking_id": booking.id.to_string(),
                        "slot_id": booking.slot_id.to_string(),
                    }),
                    now,
                )
                .await?;
        }
        if !holds.is_empty() {
            info!(count = holds.len(), "expired stale booking holds");
        }
        Ok(holds.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryStore, ManualClock};
    use chrono::{DateTime, Utc};

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        service: BookingService,
        student: Actor,
        teacher_id: Uuid,
        admin: Actor,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let service = BookingService::new(
                store.clone(),
                store.clone(),
                store.clone(),
                store.clone(),
                store.clone(),
                clock.clone(),
                BookingSettings::default(),
            );
            Self {
                store,
                clock,
                service,
                student: Actor {
                    id: Uuid::new_v4(),
                    role: Role::Student,
                },
                teacher_id: Uuid::new_v4(),
                admin: Actor {
                    id: Uuid::new_v4(),
                    role: Role::Admin,
                },
            }
        }

        fn now(&self) -> DateTime<Utc> {
            self.clock.now()
        }

        async fn open_slot(&self, starts_in: Duration) -> Uuid {
            let start = self.now() + starts_in;
            self.store
                .create_slot(self.teacher_id, self.admin.id, start, start + Duration::hours(1))
                .await
                .unwrap()
                .id
        }

        async fn package(&self, lessons: i32) -> Uuid {
            self.store
                .create_package(self.student.id, lessons, self.now() + Duration::days(90))
                .await
                .unwrap()
                .id
        }

        async fn confirmed_booking(&self, starts_in: Duration, package_id: Uuid) -> Booking {
            let slot_id = self.open_slot(starts_in).await;
            let hold = self
                .service
                .hold_booking(slot_id, package_id, &self.student)
                .await
                .unwrap();
            self.service
                .confirm_booking(hold.id, &self.student)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn hold_reserves_slot_without_touching_balance() {
        let fx = Fixture::new();
        let slot_id = fx.open_slot(Duration::hours(48)).await;
        let package_id = fx.package(5).await;

        let booking = fx
            .service
            .hold_booking(slot_id, package_id, &fx.student)
            .await
            .unwrap();

        assert_eq!(booking.status, BookingStatus::Hold);
        assert_eq!(
            booking.hold_expires_at,
            Some(fx.now() + Duration::minutes(10))
        );
        assert_eq!(fx.store.slot(slot_id).status, SlotStatus::Hold);
        assert_eq!(fx.store.package(package_id).lessons_left, 5);
        assert_eq!(fx.store.events_of_type("booking.hold.created").len(), 1);
    }

    #[tokio::test]
    async fn hold_rejects_non_open_slot_and_past_slot() {
        let fx = Fixture::new();
        let package_id = fx.package(1).await;

        let slot_id = fx.open_slot(Duration::hours(2)).await;
        fx.service
            .hold_booking(slot_id, package_id, &fx.student)
            .await
            .unwrap();
        let second = fx
            .service
            .hold_booking(slot_id, package_id, &fx.student)
            .await;
        assert!(matches!(second, Err(DomainError::BusinessRule(_))));

        let past_slot = fx.open_slot(Duration::hours(1)).await;
        fx.clock.advance(Duration::hours(3));
        let past = fx
            .service
            .hold_booking(past_slot, package_id, &fx.student)
            .await;
        assert!(matches!(past, Err(DomainError::BusinessRule(_))));
    }

    #[tokio::test]
    async fn hold_requires_student_role_and_package_ownership() {
        let fx = Fixture::new();
        let slot_id = fx.open_slot(Duration::hours(5)).await;
        let package_id = fx.package(5).await;

        let as_admin = fx
            .service
            .hold_booking(slot_id, package_id, &fx.admin)
            .await;
        assert!(matches!(as_admin, Err(DomainError::Unauthorized(_))));

        let other_student = Actor {
            id: Uuid::new_v4(),
            role: Role::Student,
        };
        let foreign = fx
            .service
            .hold_booking(slot_id, package_id, &other_student)
            .await;
        assert!(matches!(foreign, Err(DomainError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn concurrent_hold_on_same_slot_conflicts() {
        let fx = Fixture::new();
        let slot_id = fx.open_slot(Duration::hours(5)).await;
        let package_id = fx.package(5).await;
        fx.service
            .hold_booking(slot_id, package_id, &fx.student)
            .await
            .unwrap();

        // Simulate a racing writer that saw the slot as open: the uniqueness
        // guard on active bookings per slot must reject it.
        let racing = fx
            .store
            .create_booking_hold(
                slot_id,
                Uuid::new_v4(),
                fx.teacher_id,
                package_id,
                fx.now() + Duration::minutes(10),
            )
            .await;
        assert!(matches!(racing, Err(DomainError::Conflict(_))));
    }

    #[tokio::test]
    async fn confirm_consumes_one_lesson_and_books_slot() {
        let fx = Fixture::new();
        let slot_id = fx.open_slot(Duration::hours(48)).await;
        let package_id = fx.package(5).await;
        let hold = fx
            .service
            .hold_booking(slot_id, package_id, &fx.student)
            .await
            .unwrap();

        let booking = fx
            .service
            .confirm_booking(hold.id, &fx.student)
            .await
            .unwrap();

        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert!(booking.confirmed_at.is_some());
        assert!(booking.hold_expires_at.is_none());
        assert_eq!(fx.store.slot(slot_id).status, SlotStatus::Booked);
        assert_eq!(fx.store.package(package_id).lessons_left, 4);
        assert_eq!(fx.store.events_of_type("booking.confirmed").len(), 1);
        assert_eq!(fx.store.events_of_type("lesson.created").len(), 1);
        assert!(fx
            .store
            .get_lesson_by_booking_id(booking.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn confirm_after_expiry_expires_booking_and_releases_slot() {
        let fx = Fixture::new();
        let slot_id = fx.open_slot(Duration::hours(48)).await;
        let package_id = fx.package(5).await;
        let hold = fx
            .service
            .hold_booking(slot_id, package_id, &fx.student)
            .await
            .unwrap();

        fx.clock.advance(Duration::minutes(11));
        let result = fx.service.confirm_booking(hold.id, &fx.student).await;
        assert!(matches!(result, Err(DomainError::BusinessRule(_))));

        let booking = fx.store.booking(hold.id);
        assert_eq!(booking.status, BookingStatus::Expired);
        assert_eq!(fx.store.slot(slot_id).status, SlotStatus::Open);
        assert_eq!(fx.store.package(package_id).lessons_left, 5);
    }

    #[tokio::test]
    async fn confirm_twice_conflicts_and_keeps_single_lesson() {
        let fx = Fixture::new();
        let package_id = fx.package(5).await;
        let booking = fx
            .confirmed_booking(Duration::hours(48), package_id)
            .await;

        let second = fx.service.confirm_booking(booking.id, &fx.student).await;
        assert!(matches!(second, Err(DomainError::Conflict(_))));
        assert_eq!(fx.store.events_of_type("lesson.created").len(), 1);
        assert_eq!(fx.store.package(package_id).lessons_left, 4);
    }

    #[tokio::test]
    async fn confirm_requires_related_actor() {
        let fx = Fixture::new();
        let slot_id = fx.open_slot(Duration::hours(48)).await;
        let package_id = fx.package(5).await;
        let hold = fx
            .service
            .hold_booking(slot_id, package_id, &fx.student)
            .await
            .unwrap();

        let stranger = Actor {
            id: Uuid::new_v4(),
            role: Role::Student,
        };
        let denied = fx.service.confirm_booking(hold.id, &stranger).await;
        assert!(matches!(denied, Err(DomainError::Unauthorized(_))));

        // The booking's teacher may confirm.
        let teacher = Actor {
            id: fx.teacher_id,
            role: Role::Teacher,
        };
        fx.service.confirm_booking(hold.id, &teacher).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_outside_refund_window_returns_lesson() {
        let fx = Fixture::new();
        let package_id = fx.package(5).await;
        let booking = fx
            .confirmed_booking(Duration::hours(48), package_id)
            .await;
        assert_eq!(fx.store.package(package_id).lessons_left, 4);

        let canceled = fx
            .service
            .cancel_booking(booking.id, Some("Changed plans".to_string()), &fx.student)
            .await
            .unwrap();

        assert_eq!(canceled.status, BookingStatus::Canceled);
        assert!(canceled.refund_returned);
        assert_eq!(canceled.cancellation_reason.as_deref(), Some("Changed plans"));
        assert_eq!(fx.store.package(package_id).lessons_left, 5);
        assert_eq!(fx.store.slot(booking.slot_id).status, SlotStatus::Open);
        assert_eq!(fx.store.events_of_type("booking.canceled").len(), 1);
        assert_eq!(fx.store.events_of_type("lesson.canceled").len(), 1);
    }

    #[tokio::test]
    async fn cancel_inside_refund_window_forfeits_lesson() {
        let fx = Fixture::new();
        let package_id = fx.package(5).await;
        let booking = fx
            .confirmed_booking(Duration::hours(12), package_id)
            .await;

        let canceled = fx
            .service
            .cancel_booking(booking.id, None, &fx.student)
            .await
            .unwrap();

        assert!(!canceled.refund_returned);
        assert_eq!(fx.store.package(package_id).lessons_left, 4);
    }

    #[tokio::test]
    async fn cancel_terminal_booking_conflicts() {
        let fx = Fixture::new();
        let package_id = fx.package(5).await;
        let booking = fx
            .confirmed_booking(Duration::hours(48), package_id)
            .await;
        fx.service
            .cancel_booking(booking.id, None, &fx.student)
            .await
            .unwrap();

        let again = fx.service.cancel_booking(booking.id, None, &fx.student).await;
        assert!(matches!(again, Err(DomainError::Conflict(_))));
        // The refund was not applied twice.
        assert_eq!(fx.store.package(package_id).lessons_left, 5);
    }

    #[tokio::test]
    async fn cancel_held_booking_releases_slot_without_refund() {
        let fx = Fixture::new();
        let slot_id = fx.open_slot(Duration::hours(48)).await;
        let package_id = fx.package(5).await;
        let hold = fx
            .service
            .hold_booking(slot_id, package_id, &fx.student)
            .await
            .unwrap();

        let canceled = fx
            .service
            .cancel_booking(hold.id, None, &fx.student)
            .await
            .unwrap();
        assert!(!canceled.refund_returned);
        assert_eq!(fx.store.package(package_id).lessons_left, 5);
        assert_eq!(fx.store.slot(slot_id).status, SlotStatus::Open);
        // No lesson was ever materialized for the hold.
        assert!(fx.store.events_of_type("lesson.canceled").is_empty());
    }

    #[tokio::test]
    async fn reschedule_links_bookings_and_nets_one_lesson() {
        let fx = Fixture::new();
        let package_id = fx.package(5).await;
        let old = fx
            .confirmed_booking(Duration::hours(48), package_id)
            .await;
        assert_eq!(fx.store.package(package_id).lessons_left, 4);

        let new_slot_id = fx.open_slot(Duration::hours(72)).await;
        let new_booking = fx
            .service
            .reschedule_booking(old.id, new_slot_id, &fx.student)
            .await
            .unwrap();

        assert_eq!(new_booking.status, BookingStatus::Confirmed);
        assert_eq!(new_booking.rescheduled_from_booking_id, Some(old.id));
        assert_eq!(fx.store.booking(old.id).status, BookingStatus::Canceled);
        // Cancel outside the window refunded, confirm consumed: net one.
        assert_eq!(fx.store.package(package_id).lessons_left, 4);
        assert_eq!(fx.store.slot(old.slot_id).status, SlotStatus::Open);
        assert_eq!(fx.store.slot(new_slot_id).status, SlotStatus::Booked);
        assert_eq!(fx.store.events_of_type("booking.rescheduled").len(), 1);
    }

    #[tokio::test]
    async fn reschedule_inside_window_forfeits_and_consumes() {
        let fx = Fixture::new();
        let package_id = fx.package(5).await;
        let old = fx
            .confirmed_booking(Duration::hours(12), package_id)
            .await;
        assert_eq!(fx.store.package(package_id).lessons_left, 4);

        let new_slot_id = fx.open_slot(Duration::hours(72)).await;
        fx.service
            .reschedule_booking(old.id, new_slot_id, &fx.student)
            .await
            .unwrap();

        // Forfeited lesson plus a newly consumed one.
        assert_eq!(fx.store.package(package_id).lessons_left, 3);
    }

    #[tokio::test]
    async fn expire_holds_sweep_is_idempotent() {
        let fx = Fixture::new();
        let package_id = fx.package(5).await;
        let slot_a = fx.open_slot(Duration::hours(48)).await;
        let slot_b = fx.open_slot(Duration::hours(49)).await;
        fx.service
            .hold_booking(slot_a, package_id, &fx.student)
            .await
            .unwrap();
        fx.service
            .hold_booking(slot_b, package_id, &fx.student)
            .await
            .unwrap();

        fx.clock.advance(Duration::minutes(15));
        let first = fx.service.expire_holds(&fx.admin).await.unwrap();
        assert_eq!(first, 2);
        assert_eq!(fx.store.slot(slot_a).status, SlotStatus::Open);
        assert_eq!(fx.store.slot(slot_b).status, SlotStatus::Open);
        assert_eq!(fx.store.events_of_type("booking.hold.expired").len(), 2);

        let second = fx.service.expire_holds(&fx.admin).await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(fx.store.events_of_type("booking.hold.expired").len(), 2);
    }

    #[tokio::test]
    async fn expire_holds_requires_admin() {
        let fx = Fixture::new();
        let denied = fx.service.expire_holds(&fx.student).await;
        assert!(matches!(denied, Err(DomainError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn balance_never_leaves_bounds_across_lifecycle() {
        let fx = Fixture::new();
        let package_id = fx.package(1).await;

        // Drain the single lesson.
        let booking = fx.confirmed_booking(Duration::hours(48), package_id).await;
        assert_eq!(fx.store.package(package_id).lessons_left, 0);

        // A further confirm cannot push the balance negative.
        let slot_id = fx.open_slot(Duration::hours(50)).await;
        let denied = fx
            .service
            .hold_booking(slot_id, package_id, &fx.student)
            .await;
        assert!(matches!(denied, Err(DomainError::BusinessRule(_))));

        // Refund restores exactly to the cap, never beyond.
        fx.service
            .cancel_booking(booking.id, None, &fx.student)
            .await
            .unwrap();
        let package = fx.store.package(package_id);
        assert_eq!(package.lessons_left, 1);
        assert_eq!(package.lessons_left, package.lessons_total);
    }

    #[tokio::test]
    async fn scenario_five_lesson_package_refund_and_forfeit() {
        let fx = Fixture::new();
        let package_id = fx.package(5).await;

        // 48h out: confirm consumes, cancel outside the window refunds.
        let far = fx.confirmed_booking(Duration::hours(48), package_id).await;
        assert_eq!(fx.store.package(package_id).lessons_left, 4);
        let canceled = fx
            .service
            .cancel_booking(far.id, None, &fx.student)
            .await
            .unwrap();
        assert!(canceled.refund_returned);
        assert_eq!(fx.store.package(package_id).lessons_left, 5);

        // 12h out: confirm consumes, cancel inside the window forfeits.
        let near = fx.confirmed_booking(Duration::hours(12), package_id).await;
        assert_eq!(fx.store.package(package_id).lessons_left, 4);
        let canceled = fx
            .service
            .cancel_booking(near.id, None, &fx.student)
            .await
            .unwrap();
        assert!(!canceled.refund_returned);
        assert_eq!(fx.store.package(package_id).lessons_left, 4);
    }

    #[tokio::test]
    async fn hold_against_lapsed_package_expires_it_with_outbox_trail() {
        let fx = Fixture::new();
        let slot_id = fx.open_slot(Duration::days(10)).await;
        let package_id = fx
            .store
            .create_package(fx.student.id, 5, fx.now() + Duration::hours(1))
            .await
            .unwrap()
            .id;

        fx.clock.advance(Duration::hours(2));
        let result = fx
            .service
            .hold_booking(slot_id, package_id, &fx.student)
            .await;
        assert!(matches!(result, Err(DomainError::BusinessRule(_))));
        assert_eq!(fx.store.package(package_id).status, PackageStatus::Expired);
        assert_eq!(fx.store.events_of_type("billing.package.expired").len(), 1);
        assert_eq!(fx.store.slot(slot_id).status, SlotStatus::Open);
    }
}
