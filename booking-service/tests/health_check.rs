mod common;

use common::TestApp;

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn health_check_works() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/health", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "booking-service");
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn readiness_check_works() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/ready", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn metrics_are_exposed() {
    let app = TestApp::spawn().await;

    // Touch a route so the request counters exist.
    app.client
        .get(format!("{}/health", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    let response = app
        .client
        .get(format!("{}/metrics", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    let body = response.text().await.unwrap();
    assert!(body.contains("booking_db_query_duration_seconds"));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn customer_routes_require_identity() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/coupons", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 401);
}
