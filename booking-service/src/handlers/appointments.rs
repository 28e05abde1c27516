//! Customer appointment endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::{
    middleware::CustomerContext,
    models::{Appointment, AppointmentStatus},
    services::{NewAppointment, PaymentIntent},
    startup::AppState,
};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateAppointmentRequest {
    pub merchant_id: Uuid,
    pub service_id: Uuid,
    pub staff_id: Uuid,
    pub time_slot_id: Uuid,
    /// Calendar day, `YYYY-MM-DD`.
    pub date: NaiveDate,
    pub coupon_id: Option<Uuid>,
    #[validate(length(max = 255, message = "Remark is limited to 255 characters"))]
    pub remark: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AppointmentResponse {
    pub appointment_id: Uuid,
    pub order_no: String,
    pub date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub status: AppointmentStatus,
    pub amount: i64,
}

impl From<Appointment> for AppointmentResponse {
    fn from(appointment: Appointment) -> Self {
        Self {
            appointment_id: appointment.appointment_id,
            order_no: appointment.order_no,
            date: appointment.appointment_date,
            start_time: appointment.start_time,
            end_time: appointment.end_time,
            status: appointment.status,
            amount: appointment.amount,
        }
    }
}

pub async fn create_appointment(
    State(state): State<AppState>,
    customer: CustomerContext,
    Json(payload): Json<CreateAppointmentRequest>,
) -> Result<(StatusCode, Json<AppointmentResponse>), AppError> {
    payload.validate()?;

    let appointment = state
        .booking
        .create_appointment(NewAppointment {
            customer_id: customer.customer_id,
            merchant_id: payload.merchant_id,
            service_id: payload.service_id,
            staff_id: payload.staff_id,
            slot_id: payload.time_slot_id,
            date: payload.date,
            coupon_id: payload.coupon_id,
            remark: payload.remark.unwrap_or_default(),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(appointment.into())))
}

pub async fn get_appointment(
    State(state): State<AppState>,
    customer: CustomerContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Appointment>, AppError> {
    let appointment = state
        .booking
        .get_appointment(customer.customer_id, appointment_id)
        .await?;
    Ok(Json(appointment))
}

pub async fn cancel_appointment(
    State(state): State<AppState>,
    customer: CustomerContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<AppointmentResponse>, AppError> {
    let appointment = state
        .booking
        .cancel_appointment(customer.customer_id, appointment_id)
        .await?;
    Ok(Json(appointment.into()))
}

/// Starts payment for a confirmed appointment at its booked amount.
pub async fn pay_appointment(
    State(state): State<AppState>,
    customer: CustomerContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<(StatusCode, Json<PaymentIntent>), AppError> {
    let intent = state
        .payments
        .pay_for_appointment(customer.customer_id, appointment_id, &customer.client_ip)
        .await?;
    Ok((StatusCode::CREATED, Json(intent)))
}
