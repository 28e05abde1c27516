//! Catalog rows read by the booking path. Managed elsewhere; never locked here.

use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Service {
    pub service_id: Uuid,
    pub merchant_id: Uuid,
    pub name: String,
    pub price: i64,
    pub duration_minutes: i32,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Staff {
    pub staff_id: Uuid,
    pub merchant_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Customer {
    pub customer_id: Uuid,
    /// Gateway-side payer identity, required for JSAPI orders.
    pub openid: Option<String>,
}
