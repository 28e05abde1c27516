//! Time slot model.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::{Validate, ValidationError};

pub const TIME_SLOT_COLUMNS: &str =
    "slot_id, merchant_id, staff_id, slot_date, start_time, end_time, is_available, created_utc, updated_utc";

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TimeSlot {
    pub slot_id: Uuid,
    pub merchant_id: Uuid,
    pub staff_id: Uuid,
    pub slot_date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub is_available: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// A window in a re-authored day schedule, as `HH:MM` wall-clock strings.
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_window"))]
pub struct NewSlot {
    #[validate(length(equal = 5), custom(function = "validate_clock"))]
    pub start_time: String,
    #[validate(length(equal = 5), custom(function = "validate_clock"))]
    pub end_time: String,
}

fn validate_clock(value: &str) -> Result<(), ValidationError> {
    chrono::NaiveTime::parse_from_str(value, "%H:%M")
        .map(|_| ())
        .map_err(|_| ValidationError::new("invalid_time"))
}

fn validate_window(slot: &NewSlot) -> Result<(), ValidationError> {
    // Zero-padded HH:MM compares correctly as text.
    if slot.start_time < slot.end_time {
        Ok(())
    } else {
        Err(ValidationError::new("start_not_before_end"))
    }
}
