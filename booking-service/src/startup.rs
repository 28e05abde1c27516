//! Application startup and lifecycle management.

use crate::config::BookingConfig;
use crate::handlers::{
    appointments, coupons, health_check, internal, merchant, metrics_handler, notify, payments,
    readiness_check, timeslots,
};
use crate::services::{
    init_metrics, BookingOrchestrator, CouponLedger, Database, PaymentGateway, PaymentReconciler,
    SlotLedger, WechatPayClient,
};
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    tracing::{request_id_middleware, RequestId},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: BookingConfig,
    pub db: Database,
    pub slots: SlotLedger,
    pub coupons: CouponLedger,
    pub booking: BookingOrchestrator,
    pub payments: PaymentReconciler,
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BookingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: BookingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: BookingConfig, run_migrations: bool) -> Result<Self, AppError> {
        let config = config.validated()?;

        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let wechat = WechatPayClient::new(config.wechat.clone(), config.payment.gateway_timeout)
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to initialize WeChat Pay client");
                AppError::ConfigError(anyhow::anyhow!("WeChat Pay client: {}", e))
            })?;
        if config.payment.simulate {
            tracing::warn!("Simulated payments enabled - the gateway will not be called");
        } else if wechat.is_configured() {
            tracing::info!("WeChat Pay client initialized");
        } else {
            tracing::warn!("WeChat Pay credentials not configured - payment intents will fail");
        }
        let gateway: Arc<dyn PaymentGateway> = Arc::new(wechat);

        let pool = db.pool().clone();
        let slots = SlotLedger::new(pool.clone());
        let coupons = CouponLedger::new(pool.clone());
        let booking = BookingOrchestrator::new(pool.clone(), slots.clone(), coupons.clone());
        let payments =
            PaymentReconciler::new(pool, gateway, slots.clone(), config.payment.simulate);

        let state = AppState {
            config: config.clone(),
            db,
            slots,
            coupons,
            booking,
            payments,
        };

        // Port 0 binds a random port for tests
        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Booking service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        spawn_coupon_expiry(&self.state);

        let router = router(self.state);

        tracing::info!(
            service = "booking-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        axum::serve(self.http_listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        // Customer
        .route("/appointments", post(appointments::create_appointment))
        .route("/appointments/:id", get(appointments::get_appointment))
        .route(
            "/appointments/:id/cancel",
            put(appointments::cancel_appointment),
        )
        .route("/appointments/:id/pay", post(appointments::pay_appointment))
        .route("/payments", post(payments::create_payment))
        .route("/payments/:id", get(payments::get_payment))
        .route("/timeslots", get(timeslots::available_slots))
        .route("/coupons", get(coupons::list_coupons))
        .route("/coupons/:template_id/claim", post(coupons::claim_coupon))
        // Gateway callback
        .route("/payments/notify", post(notify::payment_notify))
        // Merchant
        .route(
            "/merchant/appointments/:id/status",
            put(merchant::update_status),
        )
        .route(
            "/merchant/appointments/:id/refund",
            post(merchant::refund_appointment),
        )
        .route("/merchant/timeslots/:staff_id", put(merchant::replace_slots))
        .route("/merchant/coupons", post(merchant::create_coupon_template))
        // Operator
        .route(
            "/internal/payments/simulate-notify",
            post(internal::simulate_notify),
        )
        .route(
            "/internal/refunds/:out_refund_no/confirm",
            post(internal::confirm_refund),
        )
        .layer(middleware::from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .extensions()
                    .get::<RequestId>()
                    .map(RequestId::as_str)
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    customer_id = tracing::field::Empty,
                    merchant_id = tracing::field::Empty,
                )
            }),
        )
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Periodically moves unused coupons past their window to `expired`.
fn spawn_coupon_expiry(state: &AppState) {
    let coupons = state.coupons.clone();
    let period = state.config.coupons.expiry_sweep_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = coupons.expire_stale().await {
                tracing::warn!(error = %e, "Coupon expiry sweep failed");
            }
        }
    });
}
