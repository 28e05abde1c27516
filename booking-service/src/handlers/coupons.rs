//! Customer coupon endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    middleware::CustomerContext,
    models::{CouponStatus, UserCoupon},
    startup::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ListCouponsQuery {
    pub status: Option<CouponStatus>,
}

pub async fn list_coupons(
    State(state): State<AppState>,
    customer: CustomerContext,
    Query(query): Query<ListCouponsQuery>,
) -> Result<Json<Vec<UserCoupon>>, AppError> {
    let coupons = state
        .coupons
        .list_user_coupons(customer.customer_id, query.status)
        .await?;
    Ok(Json(coupons))
}

pub async fn claim_coupon(
    State(state): State<AppState>,
    customer: CustomerContext,
    Path(template_id): Path<Uuid>,
) -> Result<(StatusCode, Json<UserCoupon>), AppError> {
    let coupon = state
        .coupons
        .claim(customer.customer_id, template_id)
        .await?;
    Ok((StatusCode::CREATED, Json(coupon)))
}
