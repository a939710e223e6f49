pub mod billing;
pub mod booking;
pub mod config;
pub mod domain;
pub mod memory;
pub mod outbox;
pub mod ports;
pub mod scheduling;

pub use billing::BillingService;
pub use booking::BookingService;
pub use config::{BookingSettings, OutboxSettings};
pub use domain::{
    Actor, AvailabilitySlot, Booking, BookingStatus, Lesson, LessonPackage, LessonStatus,
    Notification, NotificationStatus, OutboxEvent, OutboxStatus, PackageStatus, Payment,
    PaymentStatus, Role, SlotStatus,
};
pub use outbox::{OutboxRelay, RelayStats};
pub use ports::{
    BillingRepository, BookingRepository, Clock, DomainError, DomainResult, LessonRepository,
    NotificationRepository, OutboxRepository, SchedulingRepository, SystemClock,
};
pub use scheduling::SchedulingService;
