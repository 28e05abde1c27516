//! Payment gateway seam used by the payment reconciler.

use crate::models::PrepayPayload;
use crate::services::error::GatewayError;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// A unified order for the JSAPI in-app flow.
#[derive(Debug, Clone)]
pub struct GatewayOrder {
    pub out_trade_no: String,
    pub description: String,
    /// Minor currency units.
    pub total_fee: i64,
    pub openid: String,
    pub client_ip: String,
}

#[derive(Debug, Clone)]
pub struct GatewayRefund {
    pub out_trade_no: String,
    pub out_refund_no: String,
    pub total_fee: i64,
    pub refund_fee: i64,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RefundReceipt {
    pub gateway_refund_id: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Whether credentials are present. Calls fail with `NotConfigured` otherwise.
    fn is_configured(&self) -> bool;

    /// Places a unified order and returns the client-side payment parameters.
    async fn create_order(&self, order: &GatewayOrder) -> Result<PrepayPayload, GatewayError>;

    /// Requests a refund against a settled order.
    async fn refund(&self, refund: &GatewayRefund) -> Result<RefundReceipt, GatewayError>;

    /// Checks the signature over a notification's fields.
    fn verify_notification(&self, fields: &BTreeMap<String, String>)
        -> Result<bool, GatewayError>;
}
