//! Prometheus metrics for booking-service.
//!
//! Domain counters live in the default `prometheus` registry; HTTP request
//! metrics come from the `metrics` facade recorded by the shared middleware.
//! `/metrics` renders both.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Appointments created, cancelled or transitioned, by outcome.
pub static APPOINTMENTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "booking_appointments_total",
        "Total appointment operations by outcome",
        &["outcome"]
    )
    .expect("Failed to register APPOINTMENTS")
});

/// Coupon claims, applications, reversals and expiries.
pub static COUPON_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "booking_coupon_operations_total",
        "Total coupon operations by operation and outcome",
        &["operation", "outcome"]
    )
    .expect("Failed to register COUPON_OPERATIONS")
});

/// Gateway notifications by outcome.
pub static PAYMENT_NOTIFICATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "booking_payment_notifications_total",
        "Total payment notifications by outcome",
        &["outcome"]
    )
    .expect("Failed to register PAYMENT_NOTIFICATIONS")
});

/// Refund attempts by outcome.
pub static REFUNDS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "booking_refunds_total",
        "Total refunds by outcome",
        &["outcome"]
    )
    .expect("Failed to register REFUNDS")
});

/// Outbound gateway calls.
pub static GATEWAY_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "booking_gateway_requests_total",
        "Total payment gateway requests by operation and outcome",
        &["operation", "outcome"]
    )
    .expect("Failed to register GATEWAY_REQUESTS")
});

pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "booking_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Initialize all metrics (forces lazy initialization) and install the HTTP
/// metrics recorder once per process.
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_none() {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(e) => tracing::warn!(error = %e, "Prometheus recorder already installed"),
        }
    }

    Lazy::force(&APPOINTMENTS);
    Lazy::force(&COUPON_OPERATIONS);
    Lazy::force(&PAYMENT_NOTIFICATIONS);
    Lazy::force(&REFUNDS);
    Lazy::force(&GATEWAY_REQUESTS);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        output.push_str(&String::from_utf8_lossy(&buffer));
    }

    output
}

pub fn record_appointment(outcome: &str) {
    APPOINTMENTS.with_label_values(&[outcome]).inc();
}

pub fn record_coupon_operation(operation: &str, outcome: &str) {
    COUPON_OPERATIONS
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn record_payment_notification(outcome: &str) {
    PAYMENT_NOTIFICATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_refund(outcome: &str) {
    REFUNDS.with_label_values(&[outcome]).inc();
}

pub fn record_gateway_request(operation: &str, outcome: &str) {
    GATEWAY_REQUESTS
        .with_label_values(&[operation, outcome])
        .inc();
}
