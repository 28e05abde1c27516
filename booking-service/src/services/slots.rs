//! Slot ledger: per-staff, per-day bookable windows.
//!
//! Availability is only ever read-then-written under a row lock held by the
//! caller's transaction.

use crate::models::{NewSlot, Staff, TimeSlot, TIME_SLOT_COLUMNS};
use crate::services::error::ServiceError;
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::NaiveDate;
use sqlx::{PgConnection, PgPool};
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct SlotLedger {
    pool: PgPool,
}

impl SlotLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Locks the slot row and fails if it is already taken. Does not flip the
    /// flag; the booking transaction does that after the appointment insert.
    #[instrument(skip(self, conn), fields(slot_id = %slot_id))]
    pub async fn lock_available(
        &self,
        conn: &mut PgConnection,
        slot_id: Uuid,
    ) -> Result<TimeSlot, ServiceError> {
        let slot = sqlx::query_as::<_, TimeSlot>(&format!(
            "SELECT {} FROM time_slots WHERE slot_id = $1 FOR UPDATE",
            TIME_SLOT_COLUMNS
        ))
        .bind(slot_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(ServiceError::SlotNotFound(slot_id))?;

        if !slot.is_available {
            warn!("Time slot already booked");
            return Err(ServiceError::SlotUnavailable(slot_id));
        }

        Ok(slot)
    }

    #[instrument(skip(self, conn), fields(slot_id = %slot_id))]
    pub async fn mark_booked(
        &self,
        conn: &mut PgConnection,
        slot_id: Uuid,
    ) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE time_slots SET is_available = FALSE, updated_utc = NOW() WHERE slot_id = $1",
        )
        .bind(slot_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::SlotNotFound(slot_id));
        }
        Ok(())
    }

    /// Lock, check and flip in one step inside the caller's transaction.
    pub async fn reserve(
        &self,
        conn: &mut PgConnection,
        slot_id: Uuid,
    ) -> Result<TimeSlot, ServiceError> {
        let mut slot = self.lock_available(&mut *conn, slot_id).await?;
        self.mark_booked(&mut *conn, slot_id).await?;
        slot.is_available = false;
        Ok(slot)
    }

    #[instrument(skip(self, conn), fields(slot_id = %slot_id))]
    pub async fn release(
        &self,
        conn: &mut PgConnection,
        slot_id: Uuid,
    ) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE time_slots SET is_available = TRUE, updated_utc = NOW() WHERE slot_id = $1",
        )
        .bind(slot_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::SlotNotFound(slot_id));
        }

        info!("Time slot released");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_slot(&self, slot_id: Uuid) -> Result<Option<TimeSlot>, ServiceError> {
        let slot = sqlx::query_as::<_, TimeSlot>(&format!(
            "SELECT {} FROM time_slots WHERE slot_id = $1",
            TIME_SLOT_COLUMNS
        ))
        .bind(slot_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(slot)
    }

    #[instrument(skip(self))]
    pub async fn available_slots(
        &self,
        merchant_id: Uuid,
        staff_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<TimeSlot>, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["available_slots"])
            .start_timer();

        let slots = sqlx::query_as::<_, TimeSlot>(&format!(
            r#"
            SELECT {}
            FROM time_slots
            WHERE merchant_id = $1 AND staff_id = $2 AND slot_date = $3 AND is_available = TRUE
            ORDER BY start_time
            "#,
            TIME_SLOT_COLUMNS
        ))
        .bind(merchant_id)
        .bind(staff_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(slots)
    }

    /// Re-authors one staff member's day. Appointments bound to the old slots
    /// are deleted before the slots themselves; never call from a booking path.
    #[instrument(skip(self, new_slots), fields(merchant_id = %merchant_id, staff_id = %staff_id, date = %date, count = new_slots.len()))]
    pub async fn bulk_replace(
        &self,
        merchant_id: Uuid,
        staff_id: Uuid,
        date: NaiveDate,
        new_slots: &[NewSlot],
    ) -> Result<Vec<TimeSlot>, ServiceError> {
        check_no_overlap(new_slots)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["bulk_replace_slots"])
            .start_timer();

        let mut tx = self.pool.begin().await?;

        let staff = sqlx::query_as::<_, Staff>(
            "SELECT staff_id, merchant_id, name FROM staff WHERE staff_id = $1",
        )
        .bind(staff_id)
        .fetch_optional(&mut *tx)
        .await?
        .filter(|s| s.merchant_id == merchant_id)
        .ok_or(ServiceError::StaffNotFound(staff_id))?;

        // Lock the day so no booking can slip in between delete and insert.
        let old_ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT slot_id FROM time_slots WHERE staff_id = $1 AND slot_date = $2 FOR UPDATE",
        )
        .bind(staff_id)
        .bind(date)
        .fetch_all(&mut *tx)
        .await?;

        if !old_ids.is_empty() {
            let removed = sqlx::query("DELETE FROM appointments WHERE slot_id = ANY($1)")
                .bind(&old_ids)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if removed > 0 {
                warn!(removed, "Deleted appointments bound to replaced slots");
            }

            sqlx::query("DELETE FROM time_slots WHERE slot_id = ANY($1)")
                .bind(&old_ids)
                .execute(&mut *tx)
                .await?;
        }

        let mut inserted = Vec::with_capacity(new_slots.len());
        for slot in new_slots {
            let row = sqlx::query_as::<_, TimeSlot>(&format!(
                r#"
                INSERT INTO time_slots (slot_id, merchant_id, staff_id, slot_date, start_time, end_time, is_available)
                VALUES ($1, $2, $3, $4, $5, $6, TRUE)
                RETURNING {}
                "#,
                TIME_SLOT_COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(merchant_id)
            .bind(staff_id)
            .bind(date)
            .bind(&slot.start_time)
            .bind(&slot.end_time)
            .fetch_one(&mut *tx)
            .await?;
            inserted.push(row);
        }

        tx.commit().await?;
        timer.observe_duration();

        info!(
            staff = %staff.name,
            replaced = old_ids.len(),
            created = inserted.len(),
            "Day schedule replaced"
        );

        Ok(inserted)
    }
}

fn check_no_overlap(slots: &[NewSlot]) -> Result<(), ServiceError> {
    let mut windows: Vec<(&str, &str)> = slots
        .iter()
        .map(|s| (s.start_time.as_str(), s.end_time.as_str()))
        .collect();
    windows.sort();

    for pair in windows.windows(2) {
        let (_, prev_end) = pair[0];
        let (next_start, _) = pair[1];
        if next_start < prev_end {
            return Err(ServiceError::Validation(format!(
                "Time slots overlap at {}",
                next_start
            )));
        }
    }
    Ok(())
}
