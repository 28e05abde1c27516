//! Payment gateway callback.
//!
//! The gateway retries until it receives `return_code=SUCCESS`, so every
//! logical outcome is answered with HTTP 200 and an XML verdict.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::{
    services::{wechat::parse_xml, wechat::FAIL, wechat::SUCCESS, ServiceError},
    startup::AppState,
};

fn reply(code: &str, message: &str) -> Response {
    let body = format!(
        "<xml><return_code><![CDATA[{}]]></return_code><return_msg><![CDATA[{}]]></return_msg></xml>",
        code, message
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        body,
    )
        .into_response()
}

pub async fn payment_notify(State(state): State<AppState>, body: String) -> Response {
    let fields = match parse_xml(&body) {
        Ok(fields) => fields,
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable payment notification");
            return reply(FAIL, "invalid xml");
        }
    };

    match state.payments.handle_notification(&fields).await {
        Ok(_) => reply(SUCCESS, "OK"),
        // The failure has been recorded; redelivery would change nothing.
        Err(ServiceError::GatewayReportedFailure(_)) => reply(SUCCESS, "OK"),
        Err(ServiceError::InvalidSignature) => reply(FAIL, "signature verification failed"),
        Err(ServiceError::AmountMismatch { .. }) => reply(FAIL, "amount mismatch"),
        Err(ServiceError::UnknownOrder(_)) => reply(FAIL, "unknown order"),
        Err(ServiceError::MalformedNotification(_)) => reply(FAIL, "malformed notification"),
        Err(e) => {
            tracing::error!(error = %e, "Payment notification processing failed");
            reply(FAIL, "processing failed")
        }
    }
}
