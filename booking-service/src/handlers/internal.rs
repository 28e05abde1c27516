//! Operator endpoints guarded by the internal token.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

use crate::{
    middleware::InternalCaller,
    models::Refund,
    services::{NotificationOutcome, ServiceError},
    startup::AppState,
};

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SimulatedResult {
    Success,
    Failed,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SimulateNotifyRequest {
    #[validate(length(min = 1, max = 64))]
    pub out_trade_no: String,
    pub status: SimulatedResult,
}

#[derive(Debug, Serialize)]
pub struct SimulateNotifyResponse {
    pub out_trade_no: String,
    pub result: &'static str,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConfirmRefundRequest {
    pub success: bool,
    #[validate(length(max = 255))]
    pub reason: Option<String>,
}

pub async fn simulate_notify(
    State(state): State<AppState>,
    _caller: InternalCaller,
    Json(payload): Json<SimulateNotifyRequest>,
) -> Result<Json<SimulateNotifyResponse>, AppError> {
    payload.validate()?;

    let success = payload.status == SimulatedResult::Success;
    let result = match state
        .payments
        .simulate_notification(&payload.out_trade_no, success)
        .await
    {
        Ok(NotificationOutcome::Settled { .. }) => "settled",
        Ok(NotificationOutcome::AlreadySettled { .. }) => "already_settled",
        Err(ServiceError::GatewayReportedFailure(_)) if !success => "failed",
        Err(e) => return Err(e.into()),
    };

    Ok(Json(SimulateNotifyResponse {
        out_trade_no: payload.out_trade_no,
        result,
    }))
}

pub async fn confirm_refund(
    State(state): State<AppState>,
    _caller: InternalCaller,
    Path(out_refund_no): Path<String>,
    Json(payload): Json<ConfirmRefundRequest>,
) -> Result<Json<Refund>, AppError> {
    payload.validate()?;

    let refund = state
        .payments
        .confirm_refund(&out_refund_no, payload.success, payload.reason.as_deref())
        .await?;
    Ok(Json(refund))
}
