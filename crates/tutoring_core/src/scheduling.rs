//! crates/tutoring_core/src/scheduling.rs
//!
//! Admin-facing creation of teacher availability slots. Once a booking
//! exists for a slot, its status belongs to the booking state machine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::domain::{Actor, AvailabilitySlot};
use crate::ports::{Clock, DomainError, DomainResult, SchedulingRepository};

pub struct SchedulingService {
    slots: Arc<dyn SchedulingRepository>,
    clock: Arc<dyn Clock>,
}

impl SchedulingService {
    pub fn new(slots: Arc<dyn SchedulingRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { slots, clock }
    }

    /// Creates an open availability slot for a teacher (admin only).
    pub async fn create_slot(
        &self,
        teacher_id: Uuid,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        actor: &Actor,
    ) -> DomainResult<AvailabilitySlot> {
        if !actor.is_admin() {
            return Err(DomainError::Unauthorized(
                "Only admin can create slots".to_string(),
            ));
        }
        if end_at <= start_at {
            return Err(DomainError::BusinessRule(
                "Slot end_at must be after start_at".to_string(),
            ));
        }
        if start_at <= self.clock.now() {
            return Err(DomainError::BusinessRule(
                "Slot start_at must be in the future".to_string(),
            ));
        }

        let slot = self
            .slots
            .create_slot(teacher_id, actor.id, start_at, end_at)
            .await?;
        info!(slot_id = %slot.id, teacher_id = %teacher_id, "availability slot created");
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Role, SlotStatus};
    use crate::memory::{InMemoryStore, ManualClock};
    use chrono::Duration;

    fn admin() -> Actor {
        Actor {
            id: Uuid::new_v4(),
            role: Role::Admin,
        }
    }

    #[tokio::test]
    async fn create_slot_requires_admin() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let service = SchedulingService::new(store, clock.clone());

        let student = Actor {
            id: Uuid::new_v4(),
            role: Role::Student,
        };
        let start = clock.now() + Duration::hours(1);
        let result = service
            .create_slot(Uuid::new_v4(), start, start + Duration::hours(1), &student)
            .await;
        assert!(matches!(result, Err(DomainError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn create_slot_rejects_inverted_and_past_windows() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let service = SchedulingService::new(store, clock.clone());
        let actor = admin();

        let start = clock.now() + Duration::hours(2);
        let inverted = service
            .create_slot(Uuid::new_v4(), start, start - Duration::hours(1), &actor)
            .await;
        assert!(matches!(inverted, Err(DomainError::BusinessRule(_))));

        let past_start = clock.now() - Duration::minutes(1);
        let past = service
            .create_slot(Uuid::new_v4(), past_start, past_start + Duration::hours(1), &actor)
            .await;
        assert!(matches!(past, Err(DomainError::BusinessRule(_))));
    }

    #[tokio::test]
    async fn create_slot_starts_open() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let service = SchedulingService::new(store.clone(), clock.clone());
        let actor = admin();

        let start = clock.now() + Duration::hours(3);
        let slot = service
            .create_slot(Uuid::new_v4(), start, start + Duration::hours(1), &actor)
            .await
            .unwrap();
        assert_eq!(slot.status, SlotStatus::Open);
        assert_eq!(slot.created_by_admin_id, actor.id);
    }
}
