//! Appointment model.

use super::status::AppointmentStatus;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub const APPOINTMENT_COLUMNS: &str = "appointment_id, order_no, customer_id, merchant_id, \
    service_id, staff_id, slot_id, appointment_date, start_time, end_time, status, amount, \
    payment_id, remark, created_utc, updated_utc";

/// One booking of a staff member's slot for one service.
///
/// Start and end times are copied from the slot at booking time so the
/// appointment still renders if the slot is later re-authored.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Appointment {
    pub appointment_id: Uuid,
    pub order_no: String,
    pub customer_id: Uuid,
    pub merchant_id: Uuid,
    pub service_id: Uuid,
    pub staff_id: Uuid,
    pub slot_id: Uuid,
    pub appointment_date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    #[sqlx(try_from = "String")]
    pub status: AppointmentStatus,
    /// Final price in minor currency units, after any coupon.
    pub amount: i64,
    pub payment_id: Option<Uuid>,
    pub remark: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Appointment {
    pub fn is_owned_by(&self, customer_id: Uuid) -> bool {
        self.customer_id == customer_id
    }
}
