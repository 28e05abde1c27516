//! Merchant endpoints: appointment decisions, refunds, schedules and coupon
//! templates.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::{
    handlers::appointments::AppointmentResponse,
    middleware::MerchantContext,
    models::{AppointmentStatus, CouponTemplate, DiscountType, NewSlot, Refund, TimeSlot},
    services::NewCouponTemplate,
    startup::AppState,
};

#[derive(Debug, Deserialize, Validate)]
pub struct MerchantStatusRequest {
    pub status: AppointmentStatus,
    #[validate(length(max = 200))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    /// Minor currency units, at most the original payment.
    #[validate(range(min = 1, message = "Refund amount must be at least 1"))]
    pub amount: i64,
    #[validate(length(max = 80))]
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleDateQuery {
    pub date: NaiveDate,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReplaceSlotsRequest {
    #[validate(nested)]
    pub slots: Vec<NewSlot>,
}

#[derive(Debug, Serialize)]
pub struct ReplaceSlotsResponse {
    pub date: NaiveDate,
    pub slots: Vec<TimeSlot>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCouponTemplateRequest {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    pub discount_type: DiscountType,
    #[validate(range(min = 1))]
    pub discount_value: i64,
    #[validate(range(min = 0))]
    #[serde(default)]
    pub min_amount: i64,
    #[validate(range(min = 1, max = 365))]
    pub validity_days: i32,
    #[validate(range(min = 1))]
    pub total_count: i32,
}

pub async fn update_status(
    State(state): State<AppState>,
    merchant: MerchantContext,
    Path(appointment_id): Path<Uuid>,
    Json(payload): Json<MerchantStatusRequest>,
) -> Result<Json<AppointmentResponse>, AppError> {
    payload.validate()?;

    let appointment = state
        .booking
        .transition_by_merchant(
            merchant.merchant_id,
            appointment_id,
            payload.status,
            payload.reason.as_deref(),
        )
        .await?;
    Ok(Json(appointment.into()))
}

pub async fn refund_appointment(
    State(state): State<AppState>,
    merchant: MerchantContext,
    Path(appointment_id): Path<Uuid>,
    Json(payload): Json<RefundRequest>,
) -> Result<(StatusCode, Json<Refund>), AppError> {
    payload.validate()?;

    let refund = state
        .payments
        .initiate_refund(
            merchant.merchant_id,
            appointment_id,
            payload.amount,
            &payload.reason,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(refund)))
}

/// Replaces one staff member's slots for a day.
pub async fn replace_slots(
    State(state): State<AppState>,
    merchant: MerchantContext,
    Path(staff_id): Path<Uuid>,
    Query(query): Query<ScheduleDateQuery>,
    Json(payload): Json<ReplaceSlotsRequest>,
) -> Result<Json<ReplaceSlotsResponse>, AppError> {
    payload.validate()?;

    let slots = state
        .slots
        .bulk_replace(merchant.merchant_id, staff_id, query.date, &payload.slots)
        .await?;
    Ok(Json(ReplaceSlotsResponse {
        date: query.date,
        slots,
    }))
}

pub async fn create_coupon_template(
    State(state): State<AppState>,
    merchant: MerchantContext,
    Json(payload): Json<CreateCouponTemplateRequest>,
) -> Result<(StatusCode, Json<CouponTemplate>), AppError> {
    payload.validate()?;

    let template = state
        .coupons
        .create_template(
            merchant.merchant_id,
            NewCouponTemplate {
                name: payload.name,
                discount_type: payload.discount_type,
                discount_value: payload.discount_value,
                min_amount: payload.min_amount,
                validity_days: payload.validity_days,
                total_count: payload.total_count,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(template)))
}
