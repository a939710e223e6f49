//! crates/tutoring_core/src/domain.rs
//!
//! Defines the pure, core data structures for the marketplace.
//! These structs are independent of any database or serialization format.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

//=========================================================================================
// Status Enums
//=========================================================================================

/// System roles an acting user can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Availability slot status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Open,
    Hold,
    Booked,
    Canceled,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Open => "open",
            SlotStatus::Hold => "hold",
            SlotStatus::Booked => "booked",
            SlotStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(SlotStatus::Open),
            "hold" => Some(SlotStatus::Hold),
            "booked" => Some(SlotStatus::Booked),
            "canceled" => Some(SlotStatus::Canceled),
            _ => None,
        }
    }
}

/// Booking lifecycle status. `Canceled` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingStatus {
    Hold,
    Confirmed,
    Canceled,
    Expired,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Hold => "hold",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Canceled => "canceled",
            BookingStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hold" => Some(BookingStatus::Hold),
            "confirmed" => Some(BookingStatus::Confirmed),
            "canceled" => Some(BookingStatus::Canceled),
            "expired" => Some(BookingStatus::Expired),
            _ => None,
        }
    }
}

/// Lesson package status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageStatus {
    Active,
    Expired,
    Canceled,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Active => "active",
            PackageStatus::Expired => "expired",
            PackageStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(PackageStatus::Active),
            "expired" => Some(PackageStatus::Expired),
            "canceled" => Some(PackageStatus::Canceled),
            _ => None,
        }
    }
}

/// Payment processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PaymentStatus::Pending),
            "succeeded" => Some(PaymentStatus::Succeeded),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }
}

/// Lesson status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LessonStatus {
    Scheduled,
    Completed,
    Canceled,
}

impl LessonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LessonStatus::Scheduled => "scheduled",
            LessonStatus::Completed => "completed",
            LessonStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(LessonStatus::Scheduled),
            "completed" => Some(LessonStatus::Completed),
            "canceled" => Some(LessonStatus::Canceled),
            _ => None,
        }
    }
}

/// Outbox event status. `Processed` is terminal; `Failed` is terminal once
/// the retry budget is exhausted (dead letter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processed => "processed",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OutboxStatus::Pending),
            "processed" => Some(OutboxStatus::Processed),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// Notification delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(NotificationStatus::Pending),
            "sent" => Some(NotificationStatus::Sent),
            "failed" => Some(NotificationStatus::Failed),
            _ => None,
        }
    }
}

//=========================================================================================
// Entities
//=========================================================================================

/// The acting user for an operation, as resolved by the surrounding
/// authentication layer.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// A teacher availability slot. Status transitions after creation are owned
/// exclusively by the booking state machine.
#[derive(Debug, Clone)]
pub struct AvailabilitySlot {
    pub id: Uuid,
    pub teacher_id: Uuid,
    pub created_by_admin_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: SlotStatus,
}

/// A prepaid bundle of bookable lessons. `lessons_left` never exceeds
/// `lessons_total` and never goes below zero.
#[derive(Debug, Clone)]
pub struct LessonPackage {
    pub id: Uuid,
    pub student_id: Uuid,
    pub lessons_total: i32,
    pub lessons_left: i32,
    pub expires_at: DateTime<Utc>,
    pub status: PackageStatus,
}

/// A booking of one slot by one student, backed by a package.
/// At most one booking occupies a given slot in a non-terminal state.
#[derive(Debug, Clone)]
pub struct Booking {
    pub id: Uuid,
    pub slot_id: Uuid,
    pub student_id: Uuid,
    pub teacher_id: Uuid,
    pub package_id: Option<Uuid>,
    pub status: BookingStatus,
    pub hold_expires_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub refund_returned: bool,
    pub rescheduled_from_booking_id: Option<Uuid>,
}

/// Derived record materialized when a booking is confirmed.
#[derive(Debug, Clone)]
pub struct Lesson {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub student_id: Uuid,
    pub teacher_id: Uuid,
    pub scheduled_start_at: DateTime<Utc>,
    pub scheduled_end_at: DateTime<Utc>,
    pub status: LessonStatus,
}

/// A payment record against a package. Status records only; no gateway
/// integration.
#[derive(Debug, Clone)]
pub struct Payment {
    pub id: Uuid,
    pub package_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub external_reference: Option<String>,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
}

/// A domain event appended in the same transaction as the mutation that
/// produced it, later relayed into notifications.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Value,
    pub status: OutboxStatus,
    pub retries: i32,
    pub error_message: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A notification row produced by the outbox relay.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub channel: String,
    pub title: String,
    pub body: String,
    pub status: NotificationStatus,
    pub sent_at: Option<DateTime<Utc>>,
}
