//! Payment and refund models.

use super::status::{PaymentStatus, RefundStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub const PAYMENT_COLUMNS: &str = "payment_id, customer_id, merchant_id, appointment_id, \
    out_trade_no, transaction_id, amount, description, status, paid_utc, failure_reason, \
    notify_payload, created_utc, updated_utc";

pub const REFUND_COLUMNS: &str = "refund_id, payment_id, appointment_id, out_refund_no, \
    gateway_refund_id, amount, reason, status, refunded_utc, failure_reason, created_utc, \
    updated_utc";

/// One payment attempt. `amount` and `out_trade_no` never change after insert.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: Uuid,
    pub customer_id: Uuid,
    pub merchant_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub out_trade_no: String,
    /// Gateway-side transaction id, known once the notification arrives.
    pub transaction_id: Option<String>,
    pub amount: i64,
    pub description: String,
    #[sqlx(try_from = "String")]
    pub status: PaymentStatus,
    pub paid_utc: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Raw notification fields, retained for audit.
    #[serde(skip_serializing)]
    pub notify_payload: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Refund {
    pub refund_id: Uuid,
    pub payment_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub out_refund_no: String,
    pub gateway_refund_id: Option<String>,
    pub amount: i64,
    pub reason: String,
    #[sqlx(try_from = "String")]
    pub status: RefundStatus,
    pub refunded_utc: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Parameters handed to the client to invoke the in-app payment sheet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrepayPayload {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "timeStamp")]
    pub time_stamp: String,
    #[serde(rename = "nonceStr")]
    pub nonce_str: String,
    pub package: String,
    #[serde(rename = "signType")]
    pub sign_type: String,
    #[serde(rename = "paySign")]
    pub pay_sign: String,
}
