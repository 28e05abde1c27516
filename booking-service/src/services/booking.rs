//! Booking orchestrator: the single-transaction booking saga, customer
//! cancellation and merchant-driven status transitions.

use crate::models::{
    Actor, Appointment, AppointmentStatus, Service, APPOINTMENT_COLUMNS,
};
use crate::services::coupons::CouponLedger;
use crate::services::error::ServiceError;
use crate::services::metrics::{record_appointment, DB_QUERY_DURATION};
use crate::services::slots::SlotLedger;
use crate::utils::generate_order_no;
use chrono::{NaiveDate, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Remark column width.
const REMARK_MAX_CHARS: usize = 255;

#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub customer_id: Uuid,
    pub merchant_id: Uuid,
    pub service_id: Uuid,
    pub staff_id: Uuid,
    pub slot_id: Uuid,
    pub date: NaiveDate,
    pub coupon_id: Option<Uuid>,
    pub remark: String,
}

#[derive(Clone)]
pub struct BookingOrchestrator {
    pool: PgPool,
    slots: SlotLedger,
    coupons: CouponLedger,
}

impl BookingOrchestrator {
    pub fn new(pool: PgPool, slots: SlotLedger, coupons: CouponLedger) -> Self {
        Self {
            pool,
            slots,
            coupons,
        }
    }

    /// Books a slot. Slot lock, price, coupon soft-lock, appointment insert,
    /// slot flip and coupon finalisation commit together or not at all.
    #[instrument(
        skip(self, request),
        fields(
            customer_id = %request.customer_id,
            merchant_id = %request.merchant_id,
            slot_id = %request.slot_id,
            coupon_id = ?request.coupon_id
        )
    )]
    pub async fn create_appointment(
        &self,
        request: NewAppointment,
    ) -> Result<Appointment, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_appointment"])
            .start_timer();

        let result = self.book(&request).await;
        timer.observe_duration();

        match &result {
            Ok(appointment) => {
                record_appointment("created");
                info!(
                    appointment_id = %appointment.appointment_id,
                    order_no = %appointment.order_no,
                    amount = appointment.amount,
                    "Appointment created"
                );
            }
            Err(e) => {
                record_appointment(e.kind());
                warn!(error = %e, "Booking rejected");
            }
        }
        result
    }

    async fn book(&self, request: &NewAppointment) -> Result<Appointment, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let slot = self.slots.lock_available(&mut tx, request.slot_id).await?;
        if slot.merchant_id != request.merchant_id || slot.staff_id != request.staff_id {
            return Err(ServiceError::SlotNotFound(request.slot_id));
        }
        if slot.slot_date != request.date {
            return Err(ServiceError::Validation(format!(
                "Time slot is on {}, not {}",
                slot.slot_date, request.date
            )));
        }
        if slot.slot_date < Utc::now().date_naive() {
            return Err(ServiceError::SlotUnavailable(request.slot_id));
        }

        let service = sqlx::query_as::<_, Service>(
            r#"
            SELECT service_id, merchant_id, name, price, duration_minutes
            FROM services
            WHERE service_id = $1 AND merchant_id = $2
            "#,
        )
        .bind(request.service_id)
        .bind(request.merchant_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ServiceError::ServiceNotFound(request.service_id))?;

        let mut amount = service.price;
        if let Some(coupon_id) = request.coupon_id {
            let application = self
                .coupons
                .apply(
                    &mut tx,
                    request.customer_id,
                    coupon_id,
                    request.merchant_id,
                    service.price,
                )
                .await?;
            amount = application.final_amount;
        }

        let appointment = sqlx::query_as::<_, Appointment>(&format!(
            r#"
            INSERT INTO appointments (appointment_id, order_no, customer_id, merchant_id, service_id, staff_id, slot_id, appointment_date, start_time, end_time, status, amount, remark)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {}
            "#,
            APPOINTMENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(generate_order_no())
        .bind(request.customer_id)
        .bind(request.merchant_id)
        .bind(request.service_id)
        .bind(request.staff_id)
        .bind(request.slot_id)
        .bind(request.date)
        .bind(&slot.start_time)
        .bind(&slot.end_time)
        .bind(AppointmentStatus::Pending.as_str())
        .bind(amount)
        .bind(truncate_chars(&request.remark, REMARK_MAX_CHARS))
        .fetch_one(&mut *tx)
        .await?;

        self.slots.mark_booked(&mut tx, request.slot_id).await?;

        if let Some(coupon_id) = request.coupon_id {
            self.coupons
                .finalize(&mut tx, coupon_id, appointment.appointment_id)
                .await?;
        }

        tx.commit().await?;
        Ok(appointment)
    }

    /// Appointment detail for its owner. Other customers see not-found.
    #[instrument(skip(self))]
    pub async fn get_appointment(
        &self,
        customer_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<Appointment, ServiceError> {
        let appointment = sqlx::query_as::<_, Appointment>(&format!(
            "SELECT {} FROM appointments WHERE appointment_id = $1",
            APPOINTMENT_COLUMNS
        ))
        .bind(appointment_id)
        .fetch_optional(&self.pool)
        .await?
        .filter(|a| a.is_owned_by(customer_id))
        .ok_or(ServiceError::AppointmentNotFound(appointment_id))?;

        Ok(appointment)
    }

    /// Customer cancellation before confirmation. Releases the slot and gives
    /// the coupon back.
    #[instrument(skip(self), fields(customer_id = %customer_id, appointment_id = %appointment_id))]
    pub async fn cancel_appointment(
        &self,
        customer_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<Appointment, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let appointment = lock_appointment(&mut tx, appointment_id).await?;
        if !appointment.is_owned_by(customer_id) {
            return Err(ServiceError::NotOwner);
        }
        ensure_transition(&appointment, AppointmentStatus::Canceled, Actor::Customer)?;

        let canceled = update_status(&mut tx, appointment_id, AppointmentStatus::Canceled).await?;
        self.slots.release(&mut tx, appointment.slot_id).await?;
        self.coupons.revert(&mut tx, &appointment).await?;

        tx.commit().await?;

        record_appointment("canceled");
        info!("Appointment canceled by customer");
        Ok(canceled)
    }

    /// Merchant accept/decline/complete/cancel. Declines and cancellations
    /// release the slot and restore an unpaid coupon.
    #[instrument(skip(self, reason), fields(merchant_id = %merchant_id, appointment_id = %appointment_id, target = %target))]
    pub async fn transition_by_merchant(
        &self,
        merchant_id: Uuid,
        appointment_id: Uuid,
        target: AppointmentStatus,
        reason: Option<&str>,
    ) -> Result<Appointment, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let appointment = lock_appointment(&mut tx, appointment_id).await?;
        if appointment.merchant_id != merchant_id {
            return Err(ServiceError::NotOwner);
        }
        ensure_transition(&appointment, target, Actor::Merchant)?;

        let remark = append_reason(&appointment.remark, reason);
        let updated = sqlx::query_as::<_, Appointment>(&format!(
            r#"
            UPDATE appointments
            SET status = $1, remark = $2, updated_utc = NOW()
            WHERE appointment_id = $3
            RETURNING {}
            "#,
            APPOINTMENT_COLUMNS
        ))
        .bind(target.as_str())
        .bind(&remark)
        .bind(appointment_id)
        .fetch_one(&mut *tx)
        .await?;

        if target.releases_slot() {
            self.slots.release(&mut tx, appointment.slot_id).await?;
            self.coupons.revert(&mut tx, &appointment).await?;
        }

        tx.commit().await?;

        record_appointment(target.as_str());
        info!(from = %appointment.status, "Appointment transitioned by merchant");
        Ok(updated)
    }
}

/// Locks an appointment row for the rest of the caller's transaction.
pub(crate) async fn lock_appointment(
    conn: &mut PgConnection,
    appointment_id: Uuid,
) -> Result<Appointment, ServiceError> {
    sqlx::query_as::<_, Appointment>(&format!(
        "SELECT {} FROM appointments WHERE appointment_id = $1 FOR UPDATE",
        APPOINTMENT_COLUMNS
    ))
    .bind(appointment_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(ServiceError::AppointmentNotFound(appointment_id))
}

pub(crate) async fn update_status(
    conn: &mut PgConnection,
    appointment_id: Uuid,
    status: AppointmentStatus,
) -> Result<Appointment, ServiceError> {
    let appointment = sqlx::query_as::<_, Appointment>(&format!(
        r#"
        UPDATE appointments
        SET status = $1, updated_utc = NOW()
        WHERE appointment_id = $2
        RETURNING {}
        "#,
        APPOINTMENT_COLUMNS
    ))
    .bind(status.as_str())
    .bind(appointment_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(appointment)
}

pub(crate) fn ensure_transition(
    appointment: &Appointment,
    to: AppointmentStatus,
    actor: Actor,
) -> Result<(), ServiceError> {
    if appointment.status.can_transition(to, actor) {
        Ok(())
    } else {
        warn!(
            from = %appointment.status,
            to = %to,
            actor = actor.as_str(),
            "Rejected appointment transition"
        );
        Err(ServiceError::InvalidTransition {
            from: appointment.status,
            to,
        })
    }
}

fn append_reason(remark: &str, reason: Option<&str>) -> String {
    let combined = match reason.map(str::trim).filter(|r| !r.is_empty()) {
        None => remark.to_string(),
        Some(reason) if remark.is_empty() => format!("Merchant: {}", reason),
        Some(reason) => format!("{}\nMerchant: {}", remark, reason),
    };
    truncate_chars(&combined, REMARK_MAX_CHARS)
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}
