use axum::{
    extract::{Query, State},
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

use crate::{middleware::CustomerContext, models::TimeSlot, startup::AppState};

#[derive(Debug, Deserialize)]
pub struct AvailableSlotsQuery {
    pub merchant_id: Uuid,
    pub staff_id: Uuid,
    pub date: NaiveDate,
}

/// Open slots for one staff member on one day, earliest first.
pub async fn available_slots(
    State(state): State<AppState>,
    _customer: CustomerContext,
    Query(query): Query<AvailableSlotsQuery>,
) -> Result<Json<Vec<TimeSlot>>, AppError> {
    let slots = state
        .slots
        .available_slots(query.merchant_id, query.staff_id, query.date)
        .await?;
    Ok(Json(slots))
}
