//! crates/tutoring_core/src/billing.rs
//!
//! Lesson package and payment rules. Package balance itself is only mutated
//! through the repository's consume/return operations, driven by the booking
//! state machine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::domain::{Actor, LessonPackage, PackageStatus, Payment, PaymentStatus, Role};
use crate::ports::{BillingRepository, Clock, DomainError, DomainResult, OutboxRepository};

pub struct BillingService {
    billing: Arc<dyn BillingRepository>,
    outbox: Arc<dyn OutboxRepository>,
    clock: Arc<dyn Clock>,
}

impl BillingService {
    pub fn new(
        billing: Arc<dyn BillingRepository>,
        outbox: Arc<dyn OutboxRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            billing,
            outbox,
            clock,
        }
    }

    /// Creates a lesson package for a student (admin only).
    pub async fn create_package(
        &self,
        student_id: Uuid,
        lessons_total: i32,
        expires_at: DateTime<Utc>,
        actor: &Actor,
    ) -> DomainResult<LessonPackage> {
        if !actor.is_admin() {
            return Err(DomainError::Unauthorized(
                "Only admin can create lesson packages".to_string(),
            ));
        }
        if lessons_total < 1 {
            return Err(DomainError::BusinessRule(
                "Package must contain at least one lesson".to_string(),
            ));
        }
        if expires_at <= self.clock.now() {
            return Err(DomainError::BusinessRule(
                "Package expiration must be in the future".to_string(),
            ));
        }

        let package = self
            .billing
            .create_package(student_id, lessons_total, expires_at)
            .await?;
        self.outbox
            .append_event(
                "billing",
                &package.id.to_string(),
                "billing.package.created",
                json!({
                    "package_id": package.id.to_string(),
                    "student_id": package.student_id.to_string(),
                    "lessons_total": package.lessons_total,
                }),
                self.clock.now(),
            )
            .await?;
        info!(package_id = %package.id, student_id = %student_id, "lesson package created");
        Ok(package)
    }

    /// Returns the package if it is usable for booking: owned by the student,
    /// active, unexpired and with balance left.
    ///
    /// A package found past its expiry while still `active` is explicitly
    /// transitioned to `expired` here, with the transition recorded on the
    /// outbox, before the call fails.
    pub async fn get_active_package(
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
                self.expire_package(&package).await?;
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

    /// Expires all active packages past their expiration timestamp (admin
    /// sweep). Returns the number of packages transitioned.
    pub async fn expire_packages(&self, actor: &Actor) -> DomainResult<usize> {
        if !actor.is_admin() {
            return Err(DomainError::Unauthorized(
                "Only admin can expire packages".to_string(),
            ));
        }

        let packages = self
            .billing
            .find_packages_to_expire(self.clock.now())
            .await?;
        for package in &packages {
            self.expire_package(package).await?;
        }
        Ok(packages.len())
    }

    async fn expire_package(&self, package: &LessonPackage) -> DomainResult<()> {
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
        info!(package_id = %package.id, "lesson package expired");
        Ok(())
    }

    /// Creates a pending payment record for a package.
    pub async fn create_payment(
        &self,
        package_id: Uuid,
        amount_cents: i64,
        currency: &str,
        external_reference: Option<&str>,
        actor: &Actor,
    ) -> DomainResult<Payment> {
        if actor.role == Role::Teacher {
            return Err(DomainError::Unauthorized(
                "Role is not allowed for payments".to_string(),
            ));
        }

        let package = self
            .billing
            .get_package_by_id(package_id)
            .await?
            .ok_or_else(|| DomainError::NotFound("Package not found".to_string()))?;
        if actor.role == Role::Student && package.student_id != actor.id {
            return Err(DomainError::Unauthorized(
                "Students can pay only their packages".to_string(),
            ));
        }

        let payment = self
            .billing
            .create_payment(
                package_id,
                amount_cents,
                &currency.to_uppercase(),
                external_reference,
            )
            .await?;
        self.outbox
            .append_event(
                "billing",
                &payment.id.to_string(),
                "billing.payment.created",
                json!({
                    "payment_id": payment.id.to_string(),
                    "package_id": payment.package_id.to_string(),
                    "status": payment.status.as_str(),
                }),
                self.clock.now(),
            )
            .await?;
        Ok(payment)
    }

    /// Updates payment status (admin only), enforcing the allowed transition
    /// matrix. Updating to the current status is a no-op.
    pub async fn update_payment_status(
        &self,
        payment_id: Uuid,
        to_status: PaymentStatus,
        actor: &Actor,
    ) -> DomainResult<Payment> {
        if !actor.is_admin() {
            return Err(DomainError::Unauthorized(
                "Only admin can update payment status".to_string(),
            ));
        }

        let mut payment = self
            .billing
            .get_payment_by_id(payment_id)
            .await?
            .ok_or_else(|| DomainError::NotFound("Payment not found".to_string()))?;
        if payment.status == to_status {
            return Ok(payment);
        }
        let from_status = payment.status;

        let allowed = match (from_status, to_status) {
            (PaymentStatus::Pending, PaymentStatus::Succeeded | PaymentStatus::Failed) => true,
            (PaymentStatus::Failed, PaymentStatus::Pending | PaymentStatus::Succeeded) => true,
            (PaymentStatus::Succeeded, PaymentStatus::Refunded) => true,
            _ => false,
        };
        if !allowed {
            return Err(DomainError::BusinessRule(format!(
                "Invalid payment status transition: {} -> {}",
                from_status.as_str(),
                to_status.as_str()
            )));
        }

        let paid_at = match to_status {
            PaymentStatus::Succeeded => payment.paid_at.or_else(|| Some(self.clock.now())),
            PaymentStatus::Refunded => payment.paid_at,
            _ => None,
        };

        self.billing
            .set_payment_status(payment_id, to_status, paid_at)
            .await?;
        payment.status = to_status;
        payment.paid_at = paid_at;

        self.outbox
            .append_event(
                "billing",
                &payment.id.to_string(),
                "billing.payment.status.updated",
                json!({
                    "payment_id": payment.id.to_string(),
                    "from_status": from_status.as_str(),
                    "to_status": to_status.as_str(),
                }),
                self.clock.now(),
            )
            .await?;
        info!(
            payment_id = %payment.id,
            from = from_status.as_str(),
            to = to_status.as_str(),
            "payment status updated"
        );
        Ok(payment)
    }
}
