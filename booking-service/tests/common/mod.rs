//! Common test utilities for booking-service integration tests.
//!
//! The tests need PostgreSQL at `TEST_DATABASE_URL` and are ignored by
//! default; run them with `cargo test -- --ignored`.

#![allow(dead_code)]

use booking_service::config::{
    BookingConfig, CouponConfig, DatabaseConfig, InternalConfig, PaymentConfig, WechatPayConfig,
};
use booking_service::startup::Application;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use reqwest::{Client, Response};
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::config::{Config as CommonConfig, Environment};
use service_core::utils::signature::{sign_params, SignType, SIGN_FIELD};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Once;
use std::time::Duration;
use uuid::Uuid;

pub const TEST_API_KEY: &str = "booking-test-api-key-0123456789ab";
pub const TEST_INTERNAL_TOKEN: &str = "test-internal-token";
pub const TEST_APP_ID: &str = "wx-test-app";
pub const TEST_MCH_ID: &str = "1900000109";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,booking_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn test_config(simulate: bool, gateway_url: &str) -> BookingConfig {
    let database_url =
        std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");

    BookingConfig {
        common: CommonConfig {
            port: 0,
            environment: Environment::Development,
        },
        service_name: "booking-service-test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: Secret::new(database_url),
            max_connections: 10,
            min_connections: 1,
        },
        wechat: WechatPayConfig {
            app_id: TEST_APP_ID.to_string(),
            mch_id: TEST_MCH_ID.to_string(),
            api_key: Secret::new(TEST_API_KEY.to_string()),
            notify_url: "http://127.0.0.1/payments/notify".to_string(),
            api_base_url: gateway_url.to_string(),
            sign_type: SignType::Md5,
            cert_path: None,
            key_path: None,
        },
        payment: PaymentConfig {
            simulate,
            gateway_timeout: Duration::from_secs(2),
        },
        internal: InternalConfig {
            api_token: Secret::new(TEST_INTERNAL_TOKEN.to_string()),
        },
        coupons: CouponConfig {
            expiry_sweep_interval: Duration::from_secs(300),
        },
    }
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub pool: PgPool,
    pub client: Client,
}

/// One merchant with a staff member, a priced service and open slots a week
/// from today, plus a customer with a linked WeChat account.
pub struct Fixture {
    pub merchant_id: Uuid,
    pub customer_id: Uuid,
    pub staff_id: Uuid,
    pub service_id: Uuid,
    pub date: NaiveDate,
    pub slot_ids: Vec<Uuid>,
}

impl TestApp {
    /// Spawns the service with simulated payments.
    pub async fn spawn() -> Self {
        Self::spawn_with(true, "http://127.0.0.1:9").await
    }

    /// Spawns the service against a (mock) gateway.
    pub async fn spawn_with_gateway(gateway_url: &str) -> Self {
        Self::spawn_with(false, gateway_url).await
    }

    async fn spawn_with(simulate: bool, gateway_url: &str) -> Self {
        init_tracing();

        let app = Application::build(test_config(simulate, gateway_url))
            .await
            .expect("Failed to build application");

        let port = app.http_port();
        let pool = app.db().pool().clone();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        Self {
            address: format!("http://127.0.0.1:{}", port),
            port,
            pool,
            client: Client::new(),
        }
    }

    pub async fn seed(&self, price: i64, slot_count: usize) -> Fixture {
        let merchant_id = Uuid::new_v4();
        let staff_id = Uuid::new_v4();
        let service_id = Uuid::new_v4();
        let date = Utc::now().date_naive() + ChronoDuration::days(7);

        sqlx::query("INSERT INTO merchants (merchant_id, name) VALUES ($1, 'Test Salon')")
            .bind(merchant_id)
            .execute(&self.pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO staff (staff_id, merchant_id, name) VALUES ($1, $2, 'Alex')")
            .bind(staff_id)
            .bind(merchant_id)
            .execute(&self.pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO services (service_id, merchant_id, name, price, duration_minutes) VALUES ($1, $2, 'Haircut', $3, 60)",
        )
        .bind(service_id)
        .bind(merchant_id)
        .bind(price)
        .execute(&self.pool)
        .await
        .unwrap();

        let mut slot_ids = Vec::with_capacity(slot_count);
        for hour in 0..slot_count {
            let slot_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO time_slots (slot_id, merchant_id, staff_id, slot_date, start_time, end_time) VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(slot_id)
            .bind(merchant_id)
            .bind(staff_id)
            .bind(date)
            .bind(format!("{:02}:00", 9 + hour))
            .bind(format!("{:02}:00", 10 + hour))
            .execute(&self.pool)
            .await
            .unwrap();
            slot_ids.push(slot_id);
        }

        Fixture {
            merchant_id,
            customer_id: self.add_customer().await,
            staff_id,
            service_id,
            date,
            slot_ids,
        }
    }

    pub async fn add_customer(&self) -> Uuid {
        let customer_id = Uuid::new_v4();
        sqlx::query("INSERT INTO customers (customer_id, openid) VALUES ($1, $2)")
            .bind(customer_id)
            .bind(format!("o-{}", customer_id.simple()))
            .execute(&self.pool)
            .await
            .unwrap();
        customer_id
    }

    pub async fn create_template(
        &self,
        merchant_id: Uuid,
        discount_type: &str,
        discount_value: i64,
        min_amount: i64,
        total_count: i32,
    ) -> Uuid {
        let response = self
            .client
            .post(format!("{}/merchant/coupons", self.address))
            .header("X-Merchant-ID", merchant_id.to_string())
            .json(&json!({
                "name": "Welcome offer",
                "discount_type": discount_type,
                "discount_value": discount_value,
                "min_amount": min_amount,
                "validity_days": 7,
                "total_count": total_count,
            }))
            .send()
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status().as_u16(), 201);

        let body: Value = response.json().await.unwrap();
        body["template_id"].as_str().unwrap().parse().unwrap()
    }

    pub async fn claim(&self, customer_id: Uuid, template_id: Uuid) -> Response {
        self.client
            .post(format!("{}/coupons/{}/claim", self.address, template_id))
            .header("X-User-ID", customer_id.to_string())
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Claims a coupon and returns its id.
    pub async fn claim_ok(&self, customer_id: Uuid, template_id: Uuid) -> Uuid {
        let response = self.claim(customer_id, template_id).await;
        assert_eq!(response.status().as_u16(), 201);
        let body: Value = response.json().await.unwrap();
        body["coupon_id"].as_str().unwrap().parse().unwrap()
    }

    pub async fn book(
        &self,
        fixture: &Fixture,
        customer_id: Uuid,
        slot_id: Uuid,
        coupon_id: Option<Uuid>,
    ) -> Response {
        self.client
            .post(format!("{}/appointments", self.address))
            .header("X-User-ID", customer_id.to_string())
            .json(&json!({
                "merchant_id": fixture.merchant_id,
                "service_id": fixture.service_id,
                "staff_id": fixture.staff_id,
                "time_slot_id": slot_id,
                "date": fixture.date,
                "coupon_id": coupon_id,
                "remark": "first visit",
            }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Books and returns the appointment body.
    pub async fn book_ok(
        &self,
        fixture: &Fixture,
        slot_id: Uuid,
        coupon_id: Option<Uuid>,
    ) -> Value {
        let response = self
            .book(fixture, fixture.customer_id, slot_id, coupon_id)
            .await;
        assert_eq!(response.status().as_u16(), 201);
        response.json().await.unwrap()
    }

    pub async fn merchant_status(
        &self,
        merchant_id: Uuid,
        appointment_id: &str,
        status: &str,
    ) -> Response {
        self.client
            .put(format!(
                "{}/merchant/appointments/{}/status",
                self.address, appointment_id
            ))
            .header("X-Merchant-ID", merchant_id.to_string())
            .json(&json!({ "status": status, "reason": "test" }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Books a slot and has the merchant confirm it.
    pub async fn confirmed_appointment(&self, fixture: &Fixture, slot_id: Uuid) -> Value {
        let appointment = self.book_ok(fixture, slot_id, None).await;
        let id = appointment["appointment_id"].as_str().unwrap();
        let response = self.merchant_status(fixture.merchant_id, id, "confirmed").await;
        assert_eq!(response.status().as_u16(), 200);
        appointment
    }

    pub async fn notify(&self, xml: String) -> BTreeMap<String, String> {
        let response = self
            .client
            .post(format!("{}/payments/notify", self.address))
            .header("Content-Type", "text/xml")
            .body(xml)
            .send()
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status().as_u16(), 200);
        booking_service::services::wechat::parse_xml(&response.text().await.unwrap()).unwrap()
    }

    pub async fn slot_available(&self, slot_id: Uuid) -> bool {
        sqlx::query_scalar::<_, bool>("SELECT is_available FROM time_slots WHERE slot_id = $1")
            .bind(slot_id)
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    pub async fn coupon_state(&self, coupon_id: Uuid) -> (String, Option<Uuid>) {
        sqlx::query_as::<_, (String, Option<Uuid>)>(
            "SELECT status, appointment_id FROM user_coupons WHERE coupon_id = $1",
        )
        .bind(coupon_id)
        .fetch_one(&self.pool)
        .await
        .unwrap()
    }

    pub async fn appointment_status(&self, appointment_id: &str) -> String {
        sqlx::query_scalar::<_, String>("SELECT status FROM appointments WHERE appointment_id = $1")
            .bind(Uuid::parse_str(appointment_id).unwrap())
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    pub async fn appointments_for_slot(&self, slot_id: Uuid) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM appointments WHERE slot_id = $1")
            .bind(slot_id)
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

/// A gateway payment notification signed with the test key.
pub fn signed_notification(out_trade_no: &str, total_fee: i64) -> BTreeMap<String, String> {
    let mut fields: BTreeMap<String, String> = [
        ("appid", TEST_APP_ID),
        ("mch_id", TEST_MCH_ID),
        ("nonce_str", "5K8264ILTKCH16CQ2502SI8ZNMTM67VS"),
        ("result_code", "SUCCESS"),
        ("return_code", "SUCCESS"),
        ("openid", "o-test"),
        ("trade_type", "JSAPI"),
        ("transaction_id", "4200000000202601011234567890"),
        ("time_end", "20260101120000"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    fields.insert("out_trade_no".to_string(), out_trade_no.to_string());
    fields.insert("total_fee".to_string(), total_fee.to_string());
    sign(&mut fields);
    fields
}

pub fn sign(fields: &mut BTreeMap<String, String>) {
    fields.remove(SIGN_FIELD);
    let sign = sign_params(fields, TEST_API_KEY, SignType::Md5).unwrap();
    fields.insert(SIGN_FIELD.to_string(), sign);
}

pub fn to_xml(fields: &BTreeMap<String, String>) -> String {
    booking_service::services::wechat::to_xml(fields).unwrap()
}
