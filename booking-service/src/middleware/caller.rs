//! Caller identity extractors.
//!
//! The upstream auth gateway authenticates users and forwards their identity
//! in headers. Operator routes instead present a shared internal token.

use crate::startup::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use subtle::ConstantTimeEq;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "X-User-ID";
pub const MERCHANT_ID_HEADER: &str = "X-Merchant-ID";
pub const INTERNAL_TOKEN_HEADER: &str = "X-Internal-Token";

fn header_uuid(parts: &Parts, name: &str) -> Result<Uuid, AppError> {
    let value = parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing {} header", name)))?;

    Uuid::parse_str(value.trim())
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid {} header", name)))
}

/// Best-effort client address for the gateway's risk checks.
fn client_ip(parts: &Parts) -> String {
    let forwarded = parts
        .headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or_else(|| {
            parts
                .headers
                .get("X-Real-IP")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .unwrap_or("127.0.0.1")
        .to_string()
}

/// Authenticated customer.
#[derive(Debug, Clone)]
pub struct CustomerContext {
    pub customer_id: Uuid,
    pub client_ip: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for CustomerContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let customer_id = header_uuid(parts, USER_ID_HEADER)?;
        tracing::Span::current().record("customer_id", tracing::field::display(customer_id));

        Ok(Self {
            customer_id,
            client_ip: client_ip(parts),
        })
    }
}

/// Authenticated merchant operator.
#[derive(Debug, Clone)]
pub struct MerchantContext {
    pub merchant_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for MerchantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let merchant_id = header_uuid(parts, MERCHANT_ID_HEADER)?;
        tracing::Span::current().record("merchant_id", tracing::field::display(merchant_id));

        Ok(Self { merchant_id })
    }
}

/// Operator holding the internal API token. An unset token disables the
/// internal routes entirely.
#[derive(Debug, Clone, Copy)]
pub struct InternalCaller;

#[async_trait]
impl FromRequestParts<AppState> for InternalCaller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let expected = state.config.internal.api_token.expose_secret();
        if expected.is_empty() {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Internal API is disabled"
            )));
        }

        let presented = parts
            .headers
            .get(INTERNAL_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(Self)
        } else {
            tracing::warn!("Rejected internal call with invalid token");
            Err(AppError::Unauthorized(anyhow::anyhow!(
                "Invalid internal token"
            )))
        }
    }
}
