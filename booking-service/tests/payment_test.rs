mod common;

use common::{signed_notification, sign, to_xml, TestApp, TEST_API_KEY, TEST_INTERNAL_TOKEN};
use serde_json::{json, Value};
use service_core::utils::signature::{sign_params, SignType, SIGN_FIELD};
use std::collections::BTreeMap;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Inserts a pending gateway payment for an appointment, as a unified order
/// would have.
async fn pending_payment(app: &TestApp, appointment: &Value, customer_id: Uuid) -> String {
    let out_trade_no = format!("P123{}", &Uuid::new_v4().simple().to_string()[..12]);
    sqlx::query(
        r#"
        INSERT INTO payments (payment_id, customer_id, appointment_id, out_trade_no, amount, description, status)
        VALUES ($1, $2, $3, $4, $5, 'Haircut', 'pending')
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(customer_id)
    .bind(Uuid::parse_str(appointment["appointment_id"].as_str().unwrap()).unwrap())
    .bind(&out_trade_no)
    .bind(appointment["amount"].as_i64().unwrap())
    .execute(&app.pool)
    .await
    .unwrap();
    out_trade_no
}

async fn payment_status(app: &TestApp, out_trade_no: &str) -> String {
    sqlx::query_scalar("SELECT status FROM payments WHERE out_trade_no = $1")
        .bind(out_trade_no)
        .fetch_one(&app.pool)
        .await
        .unwrap()
}

async fn simulate_notify(app: &TestApp, out_trade_no: &str, status: &str) -> reqwest::Response {
    app.client
        .post(format!("{}/internal/payments/simulate-notify", app.address))
        .header("X-Internal-Token", TEST_INTERNAL_TOKEN)
        .json(&json!({ "out_trade_no": out_trade_no, "status": status }))
        .send()
        .await
        .expect("Failed to execute request")
}

async fn pay(app: &TestApp, customer_id: Uuid, appointment_id: &str) -> reqwest::Response {
    app.client
        .post(format!("{}/appointments/{}/pay", app.address, appointment_id))
        .header("X-User-ID", customer_id.to_string())
        .send()
        .await
        .expect("Failed to execute request")
}

async fn refund(app: &TestApp, merchant_id: Uuid, appointment_id: &str, amount: i64) -> reqwest::Response {
    app.client
        .post(format!(
            "{}/merchant/appointments/{}/refund",
            app.address, appointment_id
        ))
        .header("X-Merchant-ID", merchant_id.to_string())
        .json(&json!({ "amount": amount, "reason": "customer request" }))
        .send()
        .await
        .expect("Failed to execute request")
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn verified_notification_settles_payment() {
    let app = TestApp::spawn().await;
    let fixture = app.seed(4500, 1).await;
    let appointment = app.confirmed_appointment(&fixture, fixture.slot_ids[0]).await;
    let id = appointment["appointment_id"].as_str().unwrap();
    let out_trade_no = pending_payment(&app, &appointment, fixture.customer_id).await;

    let reply = app
        .notify(to_xml(&signed_notification(&out_trade_no, 4500)))
        .await;

    assert_eq!(reply["return_code"], "SUCCESS");
    assert_eq!(payment_status(&app, &out_trade_no).await, "success");
    assert_eq!(app.appointment_status(id).await, "paid");

    let (transaction_id, paid): (Option<String>, bool) = sqlx::query_as(
        "SELECT transaction_id, paid_utc IS NOT NULL FROM payments WHERE out_trade_no = $1",
    )
    .bind(&out_trade_no)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(transaction_id.as_deref(), Some("4200000000202601011234567890"));
    assert!(paid);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn redelivered_notification_is_acknowledged_once() {
    let app = TestApp::spawn().await;
    let fixture = app.seed(4500, 1).await;
    let appointment = app.confirmed_appointment(&fixture, fixture.slot_ids[0]).await;
    let out_trade_no = pending_payment(&app, &appointment, fixture.customer_id).await;
    let xml = to_xml(&signed_notification(&out_trade_no, 4500));

    assert_eq!(app.notify(xml.clone()).await["return_code"], "SUCCESS");
    let first_update: chrono::DateTime<chrono::Utc> =
        sqlx::query_scalar("SELECT updated_utc FROM payments WHERE out_trade_no = $1")
            .bind(&out_trade_no)
            .fetch_one(&app.pool)
            .await
            .unwrap();

    assert_eq!(app.notify(xml).await["return_code"], "SUCCESS");
    let second_update: chrono::DateTime<chrono::Utc> =
        sqlx::query_scalar("SELECT updated_utc FROM payments WHERE out_trade_no = $1")
            .bind(&out_trade_no)
            .fetch_one(&app.pool)
            .await
            .unwrap();

    assert_eq!(first_update, second_update);
    assert_eq!(
        app.appointment_status(appointment["appointment_id"].as_str().unwrap())
            .await,
        "paid"
    );
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn mismatched_amount_is_never_accepted() {
    let app = TestApp::spawn().await;
    let fixture = app.seed(4500, 1).await;
    let appointment = app.confirmed_appointment(&fixture, fixture.slot_ids[0]).await;
    let out_trade_no = pending_payment(&app, &appointment, fixture.customer_id).await;

    let reply = app
        .notify(to_xml(&signed_notification(&out_trade_no, 1)))
        .await;

    assert_eq!(reply["return_code"], "FAIL");
    assert_eq!(payment_status(&app, &out_trade_no).await, "pending");
    assert_eq!(
        app.appointment_status(appointment["appointment_id"].as_str().unwrap())
            .await,
        "confirmed"
    );
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn tampered_notification_is_rejected() {
    let app = TestApp::spawn().await;
    let fixture = app.seed(4500, 1).await;
    let appointment = app.confirmed_appointment(&fixture, fixture.slot_ids[0]).await;
    let out_trade_no = pending_payment(&app, &appointment, fixture.customer_id).await;

    let mut fields = signed_notification(&out_trade_no, 4500);
    fields.insert("transaction_id".to_string(), "forged".to_string());

    let reply = app.notify(to_xml(&fields)).await;
    assert_eq!(reply["return_code"], "FAIL");
    assert_eq!(payment_status(&app, &out_trade_no).await, "pending");

    let reply = app.notify("not xml at all".to_string()).await;
    assert_eq!(reply["return_code"], "FAIL");
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn reported_failure_marks_payment_failed() {
    let app = TestApp::spawn().await;
    let fixture = app.seed(4500, 1).await;
    let appointment = app.confirmed_appointment(&fixture, fixture.slot_ids[0]).await;
    let out_trade_no = pending_payment(&app, &appointment, fixture.customer_id).await;

    let mut fields = signed_notification(&out_trade_no, 4500);
    fields.insert("result_code".to_string(), "FAIL".to_string());
    fields.insert("err_code".to_string(), "NOTENOUGH".to_string());
    sign(&mut fields);

    let reply = app.notify(to_xml(&fields)).await;
    assert_eq!(reply["return_code"], "SUCCESS");
    assert_eq!(payment_status(&app, &out_trade_no).await, "failed");
    assert_eq!(
        app.appointment_status(appointment["appointment_id"].as_str().unwrap())
            .await,
        "confirmed"
    );
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn unknown_trade_number_is_rejected() {
    let app = TestApp::spawn().await;
    let reply = app
        .notify(to_xml(&signed_notification("P-does-not-exist", 100)))
        .await;
    assert_eq!(reply["return_code"], "FAIL");
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn simulated_payment_and_refund_flow() {
    let app = TestApp::spawn().await;
    let fixture = app.seed(4500, 1).await;
    let slot_id = fixture.slot_ids[0];
    let appointment = app.confirmed_appointment(&fixture, slot_id).await;
    let id = appointment["appointment_id"].as_str().unwrap();

    let response = pay(&app, fixture.customer_id, id).await;
    assert_eq!(response.status().as_u16(), 201);
    let intent: Value = response.json().await.unwrap();
    assert_eq!(intent["simulated"], true);
    assert!(intent["pay_params"].is_null());
    let out_trade_no = intent["payment"]["out_trade_no"].as_str().unwrap().to_string();
    assert!(out_trade_no.starts_with("SIM"));

    let response = simulate_notify(&app, &out_trade_no, "success").await;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"], "settled");
    assert_eq!(app.appointment_status(id).await, "paid");

    let body: Value = simulate_notify(&app, &out_trade_no, "success")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["result"], "already_settled");

    // Above the original payment: refused before any refund row exists.
    let response = refund(&app, fixture.merchant_id, id, 4501).await;
    assert_eq!(response.status().as_u16(), 409);
    let refunds: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM refunds WHERE appointment_id = $1",
    )
    .bind(Uuid::parse_str(id).unwrap())
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(refunds, 0);

    let response = refund(&app, fixture.merchant_id, id, 4500).await;
    assert_eq!(response.status().as_u16(), 201);
    let refund_body: Value = response.json().await.unwrap();
    assert_eq!(refund_body["status"], "success");
    assert!(refund_body["out_refund_no"].as_str().unwrap().starts_with("SIMR"));

    assert_eq!(payment_status(&app, &out_trade_no).await, "refunded");
    assert_eq!(app.appointment_status(id).await, "canceled");
    assert!(app.slot_available(slot_id).await);

    // Nothing left to refund.
    let response = refund(&app, fixture.merchant_id, id, 100).await;
    assert_eq!(response.status().as_u16(), 409);

    // A refunded payment cannot be settled again.
    let response = simulate_notify(&app, &out_trade_no, "success").await;
    assert_eq!(response.status().as_u16(), 409);
    assert_eq!(payment_status(&app, &out_trade_no).await, "refunded");
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn pending_appointment_cannot_be_paid() {
    let app = TestApp::spawn().await;
    let fixture = app.seed(4500, 1).await;
    let appointment = app.book_ok(&fixture, fixture.slot_ids[0], None).await;

    let response = pay(
        &app,
        fixture.customer_id,
        appointment["appointment_id"].as_str().unwrap(),
    )
    .await;
    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn standalone_payment_amount_must_match_appointment() {
    let app = TestApp::spawn().await;
    let fixture = app.seed(4500, 1).await;
    let appointment = app.confirmed_appointment(&fixture, fixture.slot_ids[0]).await;

    let create = |amount: i64| {
        app.client
            .post(format!("{}/payments", app.address))
            .header("X-User-ID", fixture.customer_id.to_string())
            .json(&json!({
                "amount": amount,
                "description": "Haircut",
                "appointment_id": appointment["appointment_id"],
            }))
            .send()
    };

    assert_eq!(create(100).await.unwrap().status().as_u16(), 400);
    assert_eq!(create(0).await.unwrap().status().as_u16(), 422);

    let response = create(4500).await.unwrap();
    assert_eq!(response.status().as_u16(), 201);
    let intent: Value = response.json().await.unwrap();
    let payment_id = intent["payment"]["payment_id"].as_str().unwrap();

    let response = app
        .client
        .get(format!("{}/payments/{}", app.address, payment_id))
        .header("X-User-ID", fixture.customer_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let response = app
        .client
        .get(format!("{}/payments/{}", app.address, payment_id))
        .header("X-User-ID", Uuid::new_v4().to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn internal_routes_require_token() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/internal/payments/simulate-notify", app.address))
        .header("X-Internal-Token", "wrong")
        .json(&json!({ "out_trade_no": "SIM1", "status": "success" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn gateway_payment_returns_signed_pay_params() {
    let gateway = MockServer::start().await;

    let mut reply: BTreeMap<String, String> = [
        ("return_code", "SUCCESS"),
        ("result_code", "SUCCESS"),
        ("prepay_id", "wx20260101120000abcdef"),
        ("trade_type", "JSAPI"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let signature = sign_params(&reply, TEST_API_KEY, SignType::Md5).unwrap();
    reply.insert(SIGN_FIELD.to_string(), signature);

    Mock::given(method("POST"))
        .and(path("/pay/unifiedorder"))
        .respond_with(ResponseTemplate::new(200).set_body_string(to_xml(&reply)))
        .mount(&gateway)
        .await;

    let app = TestApp::spawn_with_gateway(&gateway.uri()).await;
    let fixture = app.seed(4500, 1).await;
    let appointment = app.confirmed_appointment(&fixture, fixture.slot_ids[0]).await;
    let id = appointment["appointment_id"].as_str().unwrap();

    let response = pay(&app, fixture.customer_id, id).await;
    assert_eq!(response.status().as_u16(), 201);
    let intent: Value = response.json().await.unwrap();

    assert_eq!(intent["simulated"], false);
    assert_eq!(intent["pay_params"]["package"], "prepay_id=wx20260101120000abcdef");
    assert_eq!(intent["pay_params"]["signType"], "MD5");
    let out_trade_no = intent["payment"]["out_trade_no"].as_str().unwrap().to_string();
    assert!(out_trade_no.starts_with('P'));

    // Completing the round trip through the callback.
    let reply = app
        .notify(to_xml(&signed_notification(&out_trade_no, 4500)))
        .await;
    assert_eq!(reply["return_code"], "SUCCESS");
    assert_eq!(app.appointment_status(id).await, "paid");

    // Simulation stays unavailable against a real gateway.
    let response = simulate_notify(&app, &out_trade_no, "success").await;
    assert_eq!(response.status().as_u16(), 403);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn gateway_failure_keeps_failed_payment_for_audit() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pay/unifiedorder"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&gateway)
        .await;

    let app = TestApp::spawn_with_gateway(&gateway.uri()).await;
    let fixture = app.seed(4500, 1).await;
    let appointment = app.confirmed_appointment(&fixture, fixture.slot_ids[0]).await;
    let id = appointment["appointment_id"].as_str().unwrap();

    let response = pay(&app, fixture.customer_id, id).await;
    assert_eq!(response.status().as_u16(), 502);

    let (status, reason): (String, Option<String>) = sqlx::query_as(
        "SELECT status, failure_reason FROM payments WHERE appointment_id = $1",
    )
    .bind(Uuid::parse_str(id).unwrap())
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(status, "failed");
    assert!(reason.unwrap().contains("500"));
    assert_eq!(app.appointment_status(id).await, "confirmed");
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn gateway_refund_awaits_confirmation() {
    let app = TestApp::spawn().await;
    let fixture = app.seed(4500, 1).await;
    let appointment = app.confirmed_appointment(&fixture, fixture.slot_ids[0]).await;
    let out_trade_no = pending_payment(&app, &appointment, fixture.customer_id).await;
    app.notify(to_xml(&signed_notification(&out_trade_no, 4500)))
        .await;

    // A refund accepted by the gateway but not yet resolved.
    let payment_id: Uuid =
        sqlx::query_scalar("SELECT payment_id FROM payments WHERE out_trade_no = $1")
            .bind(&out_trade_no)
            .fetch_one(&app.pool)
            .await
            .unwrap();
    let out_refund_no = format!("R{}", &Uuid::new_v4().simple().to_string()[..16]);
    sqlx::query(
        "INSERT INTO refunds (refund_id, payment_id, out_refund_no, amount, status) VALUES ($1, $2, $3, 4500, 'processing')",
    )
    .bind(Uuid::new_v4())
    .bind(payment_id)
    .bind(&out_refund_no)
    .execute(&app.pool)
    .await
    .unwrap();
    sqlx::query("UPDATE payments SET status = 'refunding' WHERE payment_id = $1")
        .bind(payment_id)
        .execute(&app.pool)
        .await
        .unwrap();

    let confirm = |success: bool| {
        app.client
            .post(format!(
                "{}/internal/refunds/{}/confirm",
                app.address, out_refund_no
            ))
            .header("X-Internal-Token", TEST_INTERNAL_TOKEN)
            .json(&json!({ "success": success }))
            .send()
    };

    let response = confirm(true).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(payment_status(&app, &out_trade_no).await, "refunded");

    let response = confirm(false).await.unwrap();
    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn late_success_settles_payment_marked_failed() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pay/unifiedorder"))
        .respond_with(ResponseTemplate::new(504))
        .mount(&gateway)
        .await;

    let app = TestApp::spawn_with_gateway(&gateway.uri()).await;
    let fixture = app.seed(4500, 1).await;
    let appointment = app.confirmed_appointment(&fixture, fixture.slot_ids[0]).await;
    let id = appointment["appointment_id"].as_str().unwrap();

    let response = pay(&app, fixture.customer_id, id).await;
    assert_eq!(response.status().as_u16(), 502);

    let out_trade_no: String =
        sqlx::query_scalar("SELECT out_trade_no FROM payments WHERE appointment_id = $1")
            .bind(Uuid::parse_str(id).unwrap())
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(payment_status(&app, &out_trade_no).await, "failed");

    // The order reached the gateway after all and the customer paid it.
    let reply = app
        .notify(to_xml(&signed_notification(&out_trade_no, 4500)))
        .await;
    assert_eq!(reply["return_code"], "SUCCESS");

    let (status, reason): (String, Option<String>) = sqlx::query_as(
        "SELECT status, failure_reason FROM payments WHERE out_trade_no = $1",
    )
    .bind(&out_trade_no)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(status, "success");
    assert!(reason.is_none());
    assert_eq!(app.appointment_status(id).await, "paid");

    // Redelivery after the late settlement is a no-op.
    let reply = app
        .notify(to_xml(&signed_notification(&out_trade_no, 4500)))
        .await;
    assert_eq!(reply["return_code"], "SUCCESS");
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn failed_payment_still_rejects_wrong_amount() {
    let app = TestApp::spawn().await;
    let fixture = app.seed(4500, 1).await;
    let appointment = app.confirmed_appointment(&fixture, fixture.slot_ids[0]).await;
    let out_trade_no = pending_payment(&app, &appointment, fixture.customer_id).await;

    let response = simulate_notify(&app, &out_trade_no, "failed").await;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(payment_status(&app, &out_trade_no).await, "failed");

    let reply = app
        .notify(to_xml(&signed_notification(&out_trade_no, 4400)))
        .await;
    assert_eq!(reply["return_code"], "FAIL");
    assert_eq!(payment_status(&app, &out_trade_no).await, "failed");
}
