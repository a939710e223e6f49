//! services/worker/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete
//! implementation of the repository ports from the `core` crate. It handles
//! all interactions with the PostgreSQL database using `sqlx`.
//!
//! All repositories share one `PgSession`, a single pooled connection with an
//! explicit transaction, so a state-machine operation and the outbox events
//! it appends commit or roll back together.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Postgres};
use tokio::sync::Mutex;
use uuid::Uuid;

use tutoring_core::domain::{
    AvailabilitySlot, Booking, BookingStatus, Lesson, LessonPackage, LessonStatus, Notification,
    NotificationStatus, OutboxEvent, OutboxStatus, PackageStatus, Payment, PaymentStatus,
    SlotStatus,
};
use tutoring_core::ports::{
    BillingRepository, BookingRepository, DomainError, DomainResult, LessonRepository,
    NotificationRepository, OutboxRepository, SchedulingRepository,
};

/// Runs database migrations at startup.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

//=========================================================================================
// Transactional Session
//=========================================================================================

/// One pooled connection holding an open transaction. Repositories created
/// from the same session see and commit the same writes.
pub struct PgSession {
    conn: Mutex<PoolConnection<Postgres>>,
}

impl PgSession {
    /// Acquires a connection from the pool and opens a transaction on it.
    pub async fn begin(pool: &PgPool) -> Result<Arc<Self>, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN").execute(&mut *conn).await?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    pub async fn commit(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.conn.lock().await;
        sqlx::query("COMMIT").execute(&mut **conn).await?;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.conn.lock().await;
        sqlx::query("ROLLBACK").execute(&mut **conn).await?;
        Ok(())
    }
}

fn unexpected(error: sqlx::Error) -> DomainError {
    DomainError::Unexpected(error.to_string())
}

fn parse_status<T>(
    value: &str,
    parse: impl FnOnce(&str) -> Option<T>,
    column: &str,
) -> DomainResult<T> {
    parse(value)
        .ok_or_else(|| DomainError::Unexpected(format!("Invalid {column} value: {value}")))
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct SlotRecord {
    id: Uuid,
    teacher_id: Uuid,
    created_by_admin_id: Uuid,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    status: String,
}

impl SlotRecord {
    fn to_domain(self) -> DomainResult<AvailabilitySlot> {
        Ok(AvailabilitySlot {
            id: self.id,
            teacher_id: self.teacher_id,
            created_by_admin_id: self.created_by_admin_id,
            start_at: self.start_at,
            end_at: self.end_at,
            status: parse_status(&self.status, SlotStatus::parse, "slot status")?,
        })
    }
}

#[derive(FromRow)]
struct PackageRecord {
    id: Uuid,
    student_id: Uuid,
    lessons_total: i32,
    lessons_left: i32,
    expires_at: DateTime<Utc>,
    status: String,
}

impl PackageRecord {
    fn to_domain(self) -> DomainResult<LessonPackage> {
        Ok(LessonPackage {
            id: self.id,
            student_id: self.student_id,
            lessons_total: self.lessons_total,
            lessons_left: self.lessons_left,
            expires_at: self.expires_at,
            status: parse_status(&self.status, PackageStatus::parse, "package status")?,
        })
    }
}

#[derive(FromRow)]
struct BookingRecord {
    id: Uuid,
    slot_id: Uuid,
    student_id: Uuid,
    teacher_id: Uuid,
    package_id: Option<Uuid>,
    status: String,
    hold_expires_at: Option<DateTime<Utc>>,
    confirmed_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
    refund_returned: bool,
    rescheduled_from_booking_id: Option<Uuid>,
}

impl BookingRecord {
    fn to_domain(self) -> DomainResult<Booking> {
        Ok(Booking {
            id: self.id,
            slot_id: self.slot_id,
            student_id: self.student_id,
            teacher_id: self.teacher_id,
            package_id: self.package_id,
            status: parse_status(&self.status, BookingStatus::parse, "booking status")?,
            hold_expires_at: self.hold_expires_at,
            confirmed_at: self.confirmed_at,
            canceled_at: self.canceled_at,
            cancellation_reason: self.cancellation_reason,
            refund_returned: self.refund_returned,
            rescheduled_from_booking_id: self.rescheduled_from_booking_id,
        })
    }
}

#[derive(FromRow)]
struct LessonRecord {
    id: Uuid,
    booking_id: Uuid,
    student_id: Uuid,
    teacher_id: Uuid,
    scheduled_start_at: DateTime<Utc>,
    scheduled_end_at: DateTime<Utc>,
    status: String,
}

impl LessonRecord {
    fn to_domain(self) -> DomainResult<Lesson> {
        Ok(Lesson {
            id: self.id,
            booking_id: self.booking_id,
            student_id: self.student_id,
            teacher_id: self.teacher_id,
            scheduled_start_at: self.scheduled_start_at,
            scheduled_end_at: self.scheduled_end_at,
            status: parse_status(&self.status, LessonStatus::parse, "lesson status")?,
        })
    }
}

#[derive(FromRow)]
struct PaymentRecord {
    id: Uuid,
    package_id: Uuid,
    amount_cents: i64,
    currency: String,
    external_reference: Option<String>,
    status: String,
    paid_at: Option<DateTime<Utc>>,
}

impl PaymentRecord {
    fn to_domain(self) -> DomainResult<Payment> {
        Ok(Payment {
            id: self.id,
            package_id: self.package_id,
            amount_cents: self.amount_cents,
            currency: self.currency,
            external_reference: self.external_reference,
            status: parse_status(&self.status, PaymentStatus::parse, "payment status")?,
            paid_at: self.paid_at,
        })
    }
}

#[derive(FromRow)]
struct OutboxEventRecord {
    id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: Value,
    status: String,
    retries: i32,
    error_message: Option<String>,
    occurred_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
}

impl OutboxEventRecord {
    fn to_domain(self) -> DomainResult<OutboxEvent> {
        Ok(OutboxEvent {
            id: self.id,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            payload: self.payload,
            status: parse_status(&self.status, OutboxStatus::parse, "outbox status")?,
            retries: self.retries,
            error_message: self.error_message,
            occurred_at: self.occurred_at,
            updated_at: self.updated_at,
            processed_at: self.processed_at,
        })
    }
}

#[derive(FromRow)]
struct NotificationRecord {
    id: Uuid,
    user_id: Uuid,
    channel: String,
    title: String,
    body: String,
    status: String,
    sent_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    fn to_domain(self) -> DomainResult<Notification> {
        Ok(Notification {
            id: self.id,
            user_id: self.user_id,
            channel: self.channel,
            title: self.title,
            body: self.body,
            status: parse_status(&self.status, NotificationStatus::parse, "notification status")?,
            sent_at: self.sent_at,
        })
    }
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements every repository port against the
/// session's transaction.
#[derive(Clone)]
pub struct PgStore {
    session: Arc<PgSession>,
}

impl PgStore {
    pub fn new(session: Arc<PgSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl SchedulingRepository for PgStore {
    async fn create_slot(
        &self,
        teacher_id: Uuid,
        created_by_admin_id: Uuid,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> DomainResult<AvailabilitySlot> {
        let mut conn = self.session.conn.lock().await;
        let record = sqlx::query_as::<_, SlotRecord>(
            "INSERT INTO availability_slots \
             (id, teacher_id, created_by_admin_id, start_at, end_at, status) \
             VALUES ($1, $2, $3, $4, $5, 'open') \
             RETURNING id, teacher_id, created_by_admin_id, start_at, end_at, status",
        )
        .bind(Uuid::new_v4())
        .bind(teacher_id)
        .bind(created_by_admin_id)
        .bind(start_at)
        .bind(end_at)
        .fetch_one(&mut **conn)
        .await
        .map_err(unexpected)?;
        record.to_domain()
    }

    async fn get_slot_by_id(&self, slot_id: Uuid) -> DomainResult<Option<AvailabilitySlot>> {
        let mut conn = self.session.conn.lock().await;
        let record = sqlx::query_as::<_, SlotRecord>(
            "SELECT id, teacher_id, created_by_admin_id, start_at, end_at, status \
             FROM availability_slots WHERE id = $1",
        )
        .bind(slot_id)
        .fetch_optional(&mut **conn)
        .await
        .map_err(unexpected)?;
        record.map(SlotRecord::to_domain).transpose()
    }

    async fn set_slot_status(&self, slot_id: Uuid, status: SlotStatus) -> DomainResult<()> {
        let mut conn = self.session.conn.lock().await;
        let result = sqlx::query("UPDATE availability_slots SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(slot_id)
            .execute(&mut **conn)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound("Slot not found".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingRepository for PgStore {
    async fn create_package(
        &self,
        student_id: Uuid,
        lessons_total: i32,
        expires_at: DateTime<Utc>,
    ) -> DomainResult<LessonPackage> {
        let mut conn = self.session.conn.lock().await;
        let record = sqlx::query_as::<_, PackageRecord>(
            "INSERT INTO lesson_packages \
             (id, student_id, lessons_total, lessons_left, expires_at, status) \
             VALUES ($1, $2, $3, $3, $4, 'active') \
             RETURNING id, student_id, lessons_total, lessons_left, expires_at, status",
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(lessons_total)
        .bind(expires_at)
        .fetch_one(&mut **conn)
        .await
        .map_err(unexpected)?;
        record.to_domain()
    }

    async fn get_package_by_id(&self, package_id: Uuid) -> DomainResult<Option<LessonPackage>> {
        let mut conn = self.session.conn.lock().await;
        let record = sqlx::query_as::<_, PackageRecord>(
            "SELECT id, student_id, lessons_total, lessons_left, expires_at, status \
             FROM lesson_packages WHERE id = $1",
        )
        .bind(package_id)
        .fetch_optional(&mut **conn)
        .await
        .map_err(unexpected)?;
        record.map(PackageRecord::to_domain).transpose()
    }

    async fn consume_package_lesson(&self, package_id: Uuid) -> DomainResult<()> {
        let mut conn = self.session.conn.lock().await;
        // The predicate guards against a concurrent consumer draining the
        // last lesson between the service's read and this write.
        let result = sqlx::query(
            "UPDATE lesson_packages SET lessons_left = lessons_left - 1 \
             WHERE id = $1 AND lessons_left > 0",
        )
        .bind(package_id)
        .execute(&mut **conn)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::BusinessRule("No lessons left".to_string()));
        }
        Ok(())
    }

    async fn return_package_lesson(&self, package_id: Uuid) -> DomainResult<()> {
        let mut conn = self.session.conn.lock().await;
        let result = sqlx::query(
            "UPDATE lesson_packages \
             SET lessons_left = LEAST(lessons_total, lessons_left + 1) \
             WHERE id = $1",
        )
        .bind(package_id)
        .execute(&mut **conn)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound("Package not found".to_string()));
        }
        Ok(())
    }

    async fn set_package_status(
        &self,
        package_id: Uuid,
        status: PackageStatus,
    ) -> DomainResult<()> {
        let mut conn = self.session.conn.lock().await;
        let result = sqlx::query("UPDATE lesson_packages SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(package_id)
            .execute(&mut **conn)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound("Package not found".to_string()));
        }
        Ok(())
    }

    async fn find_packages_to_expire(
        &self,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<LessonPackage>> {
        let mut conn = self.session.conn.lock().await;
        let records = sqlx::query_as::<_, PackageRecord>(
            "SELECT id, student_id, lessons_total, lessons_left, expires_at, status \
             FROM lesson_packages WHERE status = 'active' AND expires_at <= $1",
        )
        .bind(now)
        .fetch_all(&mut **conn)
        .await
        .map_err(unexpected)?;
        records
            .into_iter()
            .map(PackageRecord::to_domain)
            .collect()
    }

    async fn create_payment(
        &self,
        package_id: Uuid,
        amount_cents: i64,
        currency: &str,
        external_reference: Option<&str>,
    ) -> DomainResult<Payment> {
        let mut conn = self.session.conn.lock().await;
        let record = sqlx::query_as::<_, PaymentRecord>(
            "INSERT INTO payments \
             (id, package_id, amount_cents, currency, external_reference, status) \
             VALUES ($1, $2, $3, $4, $5, 'pending') \
             RETURNING id, package_id, amount_cents, currency, external_reference, status, paid_at",
        )
        .bind(Uuid::new_v4())
        .bind(package_id)
        .bind(amount_cents)
        .bind(currency)
        .bind(external_reference)
        .fetch_one(&mut **conn)
        .await
        .map_err(unexpected)?;
        record.to_domain()
    }

    async fn get_payment_by_id(&self, payment_id: Uuid) -> DomainResult<Option<Payment>> {
        let mut conn = self.session.conn.lock().await;
        let record = sqlx::query_as::<_, PaymentRecord>(
            "SELECT id, package_id, amount_cents, currency, external_reference, status, paid_at \
             FROM payments WHERE id = $1",
        )
        .bind(payment_id)
        .fetch_optional(&mut **conn)
        .await
        .map_err(unexpected)?;
        record.map(PaymentRecord::to_domain).transpose()
    }

    async fn set_payment_status(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> DomainResult<()> {
        let mut conn = self.session.conn.lock().await;
        let result = sqlx::query("UPDATE payments SET status = $1, paid_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(paid_at)
            .bind(payment_id)
            .execute(&mut **conn)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound("Payment not found".to_string()));
        }
        Ok(())
    }

    async fn get_payment_student_id(&self, payment_id: Uuid) -> DomainResult<Option<Uuid>> {
        let mut conn = self.session.conn.lock().await;
        let student_id = sqlx::query_scalar::<_, Uuid>(
            "SELECT packages.student_id FROM payments \
             JOIN lesson_packages AS packages ON packages.id = payments.package_id \
             WHERE payments.id = $1",
        )
        .bind(payment_id)
        .fetch_optional(&mut **conn)
        .await
        .map_err(unexpected)?;
        Ok(student_id)
    }
}

#[async_trait]
impl BookingRepository for PgStore {
    async fn create_booking_hold(
        &self,
        slot_id: Uuid,
        student_id: Uuid,
        teacher_id: Uuid,
        package_id: Uuid,
        hold_expires_at: DateTime<Utc>,
    ) -> DomainResult<Booking> {
        let mut conn = self.session.conn.lock().await;
        let record = sqlx::query_as::<_, BookingRecord>(
            "INSERT INTO bookings \
             (id, slot_id, student_id, teacher_id, package_id, status, hold_expires_at) \
             VALUES ($1, $2, $3, $4, $5, 'hold', $6) \
             RETURNING id, slot_id, student_id, teacher_id, package_id, status, \
                       hold_expires_at, confirmed_at, canceled_at, cancellation_reason, \
                       refund_returned, rescheduled_from_booking_id",
        )
        .bind(Uuid::new_v4())
        .bind(slot_id)
        .bind(student_id)
        .bind(teacher_id)
        .bind(package_id)
        .bind(hold_expires_at)
        .fetch_one(&mut **conn)
        .await
        .map_err(|error| match &error {
            sqlx::Error::Database(db) if db.is_unique_violation() => DomainError::Conflict(
                "Slot already has an active booking".to_string(),
            ),
            _ => unexpected(error),
        })?;
        record.to_domain()
    }

    async fn get_booking_by_id(&self, booking_id: Uuid) -> DomainResult<Option<Booking>> {
        let mut conn = self.session.conn.lock().await;
        let record = sqlx::query_as::<_, BookingRecord>(
            "SELECT id, slot_id, student_id, teacher_id, package_id, status, \
                    hold_expires_at, confirmed_at, canceled_at, cancellation_reason, \
                    refund_returned, rescheduled_from_booking_id \
             FROM bookings WHERE id = $1",
        )
        .bind(booking_id)
        .fetch_optional(&mut **conn)
        .await
        .map_err(unexpected)?;
        record.map(BookingRecord::to_domain).transpose()
    }

    async fn find_expired_holds(&self, now: DateTime<Utc>) -> DomainResult<Vec<Booking>> {
        let mut conn = self.session.conn.lock().await;
        let records = sqlx::query_as::<_, BookingRecord>(
            "SELECT id, slot_id, student_id, teacher_id, package_id, status, \
                    hold_expires_at, confirmed_at, canceled_at, cancellation_reason, \
                    refund_returned, rescheduled_from_booking_id \
             FROM bookings \
             WHERE status = 'hold' AND hold_expires_at IS NOT NULL AND hold_expires_at <= $1 \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .fetch_all(&mut **conn)
        .await
        .map_err(unexpected)?;
        records
            .into_iter()
            .map(BookingRecord::to_domain)
            .collect()
    }

    async fn update_booking(&self, booking: &Booking) -> DomainResult<()> {
        let mut conn = self.session.conn.lock().await;
        let result = sqlx::query(
            "UPDATE bookings SET status = $1, hold_expires_at = $2, confirmed_at = $3, \
             canceled_at = $4, cancellation_reason = $5, refund_returned = $6, \
             rescheduled_from_booking_id = $7 WHERE id = $8",
        )
        .bind(booking.status.as_str())
        .bind(booking.hold_expires_at)
        .bind(booking.confirmed_at)
        .bind(booking.canceled_at)
        .bind(booking.cancellation_reason.as_deref())
        .bind(booking.refund_returned)
        .bind(booking.rescheduled_from_booking_id)
        .bind(booking.id)
        .execute(&mut **conn)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound("Booking not found".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LessonRepository for PgStore {
    async fn create_lesson(
        &self,
        booking_id: Uuid,
        student_id: Uuid,
        teacher_id: Uuid,
        scheduled_start_at: DateTime<Utc>,
        scheduled_end_at: DateTime<Utc>,
    ) -> DomainResult<Lesson> {
        let mut conn = self.session.conn.lock().await;
        let record = sqlx::query_as::<_, LessonRecord>(
            "INSERT INTO lessons \
             (id, booking_id, student_id, teacher_id, scheduled_start_at, scheduled_end_at, status) \
             VALUES ($1, $2, $3, $4, $5, $6, 'scheduled') \
             RETURNING id, booking_id, student_id, teacher_id, \
                       scheduled_start_at, scheduled_end_at, status",
        )
        .bind(Uuid::new_v4())
        .bind(booking_id)
        .bind(student_id)
        .bind(teacher_id)
        .bind(scheduled_start_at)
        .bind(scheduled_end_at)
        .fetch_one(&mut **conn)
        .await
        .map_err(unexpected)?;
        record.to_domain()
    }

    async fn get_lesson_by_booking_id(&self, booking_id: Uuid) -> DomainResult<Option<Lesson>> {
        let mut conn = self.session.conn.lock().await;
        let record = sqlx::query_as::<_, LessonRecord>(
            "SELECT id, booking_id, student_id, teacher_id, \
                    scheduled_start_at, scheduled_end_at, status \
             FROM lessons WHERE booking_id = $1",
        )
        .bind(booking_id)
        .fetch_optional(&mut **conn)
        .await
        .map_err(unexpected)?;
        record.map(LessonRecord::to_domain).transpose()
    }

    async fn set_lesson_status(&self, lesson_id: Uuid, status: LessonStatus) -> DomainResult<()> {
        let mut conn = self.session.conn.lock().await;
        let result = sqlx::query("UPDATE lessons SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(lesson_id)
            .execute(&mut **conn)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound("Lesson not found".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for PgStore {
    async fn append_event(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
        payload: Value,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<OutboxEvent> {
        let mut conn = self.session.conn.lock().await;
        let record = sqlx::query_as::<_, OutboxEventRecord>(
            "INSERT INTO outbox_events \
             (id, aggregate_type, aggregate_id, event_type, payload, status, retries, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6) \
             RETURNING id, aggregate_type, aggregate_id, event_type, payload, status, \
                       retries, error_message, occurred_at, updated_at, processed_at",
        )
        .bind(Uuid::new_v4())
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(event_type)
        .bind(payload)
        .bind(occurred_at)
        .fetch_one(&mut **conn)
        .await
        .map_err(unexpected)?;
        record.to_domain()
    }

    async fn list_pending(&self, limit: i64) -> DomainResult<Vec<OutboxEvent>> {
        let mut conn = self.session.conn.lock().await;
        // SKIP LOCKED lets a second relay instance claim disjoint events
        // instead of double-processing or blocking.
        let records = sqlx::query_as::<_, OutboxEventRecord>(
            "SELECT id, aggregate_type, aggregate_id, event_type, payload, status, \
                    retries, error_message, occurred_at, updated_at, processed_at \
             FROM outbox_events WHERE status = 'pending' \
             ORDER BY occurred_at ASC LIMIT $1 \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(limit)
        .fetch_all(&mut **conn)
        .await
        .map_err(unexpected)?;
        records
            .into_iter()
            .map(OutboxEventRecord::to_domain)
            .collect()
    }

    async fn list_retryable_failed(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> DomainResult<Vec<OutboxEvent>> {
        let mut conn = self.session.conn.lock().await;
        let records = sqlx::query_as::<_, OutboxEventRecord>(
            "SELECT id, aggregate_type, aggregate_id, event_type, payload, status, \
                    retries, error_message, occurred_at, updated_at, processed_at \
             FROM outbox_events WHERE status = 'failed' AND retries < $2 \
             ORDER BY COALESCE(updated_at, occurred_at) ASC LIMIT $1 \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(limit)
        .bind(max_retries)
        .fetch_all(&mut **conn)
        .await
        .map_err(unexpected)?;
        records
            .into_iter()
            .map(OutboxEventRecord::to_domain)
            .collect()
    }

    async fn mark_pending(&self, event_id: Uuid, at: DateTime<Utc>) -> DomainResult<()> {
        let mut conn = self.session.conn.lock().await;
        let result = sqlx::query(
            "UPDATE outbox_events \
             SET status = 'pending', error_message = NULL, processed_at = NULL, updated_at = $2 \
             WHERE id = $1",
        )
        .bind(event_id)
        .bind(at)
        .execute(&mut **conn)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound("Outbox event not found".to_string()));
        }
        Ok(())
    }

    async fn mark_processed(&self, event_id: Uuid, at: DateTime<Utc>) -> DomainResult<()> {
        let mut conn = self.session.conn.lock().await;
        let result = sqlx::query(
            "UPDATE outbox_events \
             SET status = 'processed', error_message = NULL, processed_at = $2, updated_at = $2 \
             WHERE id = $1",
        )
        .bind(event_id)
        .bind(at)
        .execute(&mut **conn)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound("Outbox event not found".to_string()));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let mut conn = self.session.conn.lock().await;
        let result = sqlx::query(
            "UPDATE outbox_events \
             SET status = 'failed', retries = retries + 1, error_message = $2, \
                 processed_at = NULL, updated_at = $3 \
             WHERE id = $1",
        )
        .bind(event_id)
        .bind(error_message)
        .bind(at)
        .execute(&mut **conn)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound("Outbox event not found".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationRepository for PgStore {
    async fn create_notification(
        &self,
        user_id: Uuid,
        channel: &str,
        title: &str,
        body: &str,
    ) -> DomainResult<Notification> {
        let mut conn = self.session.conn.lock().await;
        let record = sqlx::query_as::<_, NotificationRecord>(
            "INSERT INTO notifications (id, user_id, channel, title, body, status) \
             VALUES ($1, $2, $3, $4, $5, 'pending') \
             RETURNING id, user_id, channel, title, body, status, sent_at",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(channel)
        .bind(title)
        .bind(body)
        .fetch_one(&mut **conn)
        .await
        .map_err(unexpected)?;
        record.to_domain()
    }

    async fn set_notification_status(
        &self,
        notification_id: Uuid,
        status: NotificationStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> DomainResult<()> {
        let mut conn = self.session.conn.lock().await;
        let result =
            sqlx::query("UPDATE notifications SET status = $1, sent_at = $2 WHERE id = $3")
                .bind(status.as_str())
                .bind(sent_at)
                .bind(notification_id)
                .execute(&mut **conn)
                .await
                .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound("Notification not found".to_string()));
        }
        Ok(())
    }
}
