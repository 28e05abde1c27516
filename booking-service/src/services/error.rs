//! Booking-service error types.

use crate::models::{AppointmentStatus, PaymentStatus, RefundStatus};
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Coupon ledger failures.
#[derive(Debug, Error)]
pub enum CouponError {
    #[error("Coupon template {0} not found")]
    TemplateNotFound(Uuid),

    #[error("Coupon template {0} has no coupons left to issue")]
    Exhausted(Uuid),

    #[error("Coupon {0} not found")]
    NotFound(Uuid),

    #[error("Coupon {0} belongs to another customer")]
    WrongOwner(Uuid),

    #[error("Coupon {0} is not available for use")]
    NotUnused(Uuid),

    #[error("Coupon {0} is not valid yet")]
    NotYetValid(Uuid),

    #[error("Coupon {0} has expired")]
    Expired(Uuid),

    #[error("Order amount {amount} is below the coupon minimum of {minimum}")]
    BelowMinimum { amount: i64, minimum: i64 },

    #[error("Coupon has unsupported discount type '{0}'")]
    UnknownDiscountType(String),

    #[error("Coupon {0} cannot be used with this merchant")]
    NotApplicable(Uuid),
}

/// Gateway transport and protocol failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Payment gateway is not configured")]
    NotConfigured,

    #[error("Gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Gateway returned HTTP {0}")]
    HttpStatus(u16),

    #[error("Gateway response could not be decoded: {0}")]
    Decode(String),

    #[error("Gateway response signature is invalid")]
    InvalidSignature,

    #[error("Gateway rejected the request: {code}: {message}")]
    Rejected { code: String, message: String },

    #[error("Gateway client error: {0}")]
    Client(String),
}

/// Service-level errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Time slot {0} not found")]
    SlotNotFound(Uuid),

    #[error("Time slot {0} is no longer available")]
    SlotUnavailable(Uuid),

    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),

    #[error("Staff {0} not found")]
    StaffNotFound(Uuid),

    #[error("Coupon is invalid: {0}")]
    Coupon(#[from] CouponError),

    #[error("Appointment {0} not found")]
    AppointmentNotFound(Uuid),

    #[error("Caller does not own this resource")]
    NotOwner,

    #[error("Appointment cannot move from {from} to {to}")]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },

    #[error("No payment with trade number {0}")]
    UnknownOrder(String),

    #[error("Notified amount {notified} does not match recorded amount {recorded} for {out_trade_no}")]
    AmountMismatch {
        out_trade_no: String,
        recorded: i64,
        notified: i64,
    },

    #[error("Gateway reported payment failure: {0}")]
    GatewayReportedFailure(String),

    #[error("Notification signature is invalid")]
    InvalidSignature,

    #[error("Notification is malformed: {0}")]
    MalformedNotification(String),

    #[error("Payment {0} not found")]
    PaymentNotFound(String),

    #[error("Payment is {status}, expected {expected}")]
    InvalidPaymentState {
        status: PaymentStatus,
        expected: PaymentStatus,
    },

    #[error("Appointment in status {0} cannot be refunded")]
    NotRefundable(AppointmentStatus),

    #[error("Appointment has no successful payment")]
    PaymentNotSucceeded,

    #[error("Refund amount {requested} exceeds payment amount {paid}")]
    RefundExceedsPayment { requested: i64, paid: i64 },

    #[error("Refund {0} not found")]
    RefundNotFound(String),

    #[error("Refund is {0}, expected processing")]
    RefundAlreadyResolved(RefundStatus),

    #[error("Simulated payments are disabled")]
    SimulationDisabled,

    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ServiceError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SlotNotFound(_) => "slot_not_found",
            Self::SlotUnavailable(_) => "slot_unavailable",
            Self::ServiceNotFound(_) => "service_not_found",
            Self::StaffNotFound(_) => "staff_not_found",
            Self::Coupon(_) => "coupon_invalid",
            Self::AppointmentNotFound(_) => "appointment_not_found",
            Self::NotOwner => "not_owner",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::UnknownOrder(_) => "unknown_order",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::GatewayReportedFailure(_) => "gateway_reported_failure",
            Self::InvalidSignature => "invalid_signature",
            Self::MalformedNotification(_) => "malformed",
            Self::PaymentNotFound(_) => "payment_not_found",
            Self::InvalidPaymentState { .. } => "invalid_payment_state",
            Self::NotRefundable(_) => "not_refundable",
            Self::PaymentNotSucceeded => "payment_not_succeeded",
            Self::RefundExceedsPayment { .. } => "refund_exceeds_payment",
            Self::RefundNotFound(_) => "refund_not_found",
            Self::RefundAlreadyResolved(_) => "refund_resolved",
            Self::SimulationDisabled => "simulation_disabled",
            Self::Gateway(_) => "gateway_error",
            Self::Validation(_) => "validation",
            Self::Database(_) => "database",
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(_) | ServiceError::MalformedNotification(_) => {
                AppError::BadRequest(anyhow::anyhow!(err.to_string()))
            }
            ServiceError::SlotNotFound(_)
            | ServiceError::ServiceNotFound(_)
            | ServiceError::StaffNotFound(_)
            | ServiceError::AppointmentNotFound(_)
            | ServiceError::UnknownOrder(_)
            | ServiceError::PaymentNotFound(_)
            | ServiceError::RefundNotFound(_)
            | ServiceError::Coupon(CouponError::TemplateNotFound(_))
            | ServiceError::Coupon(CouponError::NotFound(_)) => {
                AppError::NotFound(anyhow::anyhow!(err.to_string()))
            }
            ServiceError::NotOwner | ServiceError::Coupon(CouponError::WrongOwner(_)) => {
                AppError::Forbidden(anyhow::anyhow!(err.to_string()))
            }
            ServiceError::SimulationDisabled => {
                AppError::Forbidden(anyhow::anyhow!(err.to_string()))
            }
            ServiceError::InvalidSignature => {
                AppError::Unauthorized(anyhow::anyhow!(err.to_string()))
            }
            ServiceError::SlotUnavailable(_)
            | ServiceError::Coupon(_)
            | ServiceError::InvalidTransition { .. }
            | ServiceError::InvalidPaymentState { .. }
            | ServiceError::NotRefundable(_)
            | ServiceError::PaymentNotSucceeded
            | ServiceError::RefundExceedsPayment { .. }
            | ServiceError::RefundAlreadyResolved(_)
            | ServiceError::GatewayReportedFailure(_) => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            ServiceError::Gateway(e) => AppError::BadGateway(e.to_string()),
            ServiceError::AmountMismatch { .. } => {
                AppError::InternalError(anyhow::anyhow!(err.to_string()))
            }
            ServiceError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
        }
    }
}
