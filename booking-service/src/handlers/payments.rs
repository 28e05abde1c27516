//! Customer payment endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::{
    middleware::CustomerContext,
    models::Payment,
    services::{PaymentIntent, PaymentRequest},
    startup::AppState,
};

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePaymentRequest {
    /// Minor currency units.
    #[validate(range(min = 1, message = "Amount must be at least 1"))]
    pub amount: i64,
    #[validate(length(min = 1, max = 128))]
    pub description: String,
    pub appointment_id: Option<Uuid>,
}

pub async fn create_payment(
    State(state): State<AppState>,
    customer: CustomerContext,
    Json(payload): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<PaymentIntent>), AppError> {
    payload.validate()?;

    let intent = state
        .payments
        .create_payment_intent(
            customer.customer_id,
            PaymentRequest {
                amount: payload.amount,
                description: payload.description,
                appointment_id: payload.appointment_id,
            },
            &customer.client_ip,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(intent)))
}

pub async fn get_payment(
    State(state): State<AppState>,
    customer: CustomerContext,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<Payment>, AppError> {
    let payment = state
        .payments
        .get_payment(customer.customer_id, payment_id)
        .await?;
    Ok(Json(payment))
}
