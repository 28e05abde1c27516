//! Coupon template and user coupon models, plus the discount arithmetic.

use super::status::CouponStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const COUPON_TEMPLATE_COLUMNS: &str = "template_id, merchant_id, name, discount_type, \
    discount_value, min_amount, validity_days, remaining_count, created_utc";

pub const USER_COUPON_COLUMNS: &str = "coupon_id, customer_id, template_id, code, status, \
    valid_from, valid_to, appointment_id, used_utc, created_utc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    /// Subtract a fixed amount of minor units.
    Fixed,
    /// Subtract `value` percent, truncated to whole minor units.
    Percent,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Percent => "percent",
        }
    }

    /// Returns `(discount, final_amount)`; the final amount never drops below zero.
    pub fn apply(self, value: i64, original: i64) -> (i64, i64) {
        let discount = match self {
            Self::Fixed => value,
            Self::Percent => original * value / 100,
        };
        let final_amount = (original - discount).max(0);
        (original - final_amount, final_amount)
    }
}

impl fmt::Display for DiscountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DiscountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "percent" => Ok(Self::Percent),
            other => Err(other.to_string()),
        }
    }
}

/// Merchant-defined discount rule with a finite issuance count.
///
/// `discount_type` stays a raw string so a row written by another tool with an
/// unrecognised type surfaces as a coupon error at apply time, not a decode failure.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CouponTemplate {
    pub template_id: Uuid,
    pub merchant_id: Uuid,
    pub name: String,
    pub discount_type: String,
    pub discount_value: i64,
    pub min_amount: i64,
    pub validity_days: i32,
    pub remaining_count: i32,
    pub created_utc: DateTime<Utc>,
}

/// One claimed instance of a template.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserCoupon {
    pub coupon_id: Uuid,
    pub customer_id: Uuid,
    pub template_id: Uuid,
    pub code: String,
    #[sqlx(try_from = "String")]
    pub status: CouponStatus,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub appointment_id: Option<Uuid>,
    pub used_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

/// Outcome of applying a coupon to a price inside a booking transaction.
#[derive(Debug, Clone, Serialize)]
pub struct CouponApplication {
    pub coupon_id: Uuid,
    pub original_amount: i64,
    pub discount: i64,
    pub final_amount: i64,
}
