//! Operations router tests against an in-process engine.

mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};

use common::{fixtures, TestFixture};

#[tokio::test]
async fn test_health() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/health").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");
}

#[tokio::test]
async fn test_config_hides_moderator_addresses() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/config").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["worker"]["workers"], 2);
    assert_eq!(response.body["orders"]["max_order_items"], 200);
    assert_eq!(response.body["notifications"]["moderators_configured"], 1);
    assert!(!response.text.contains("moderator@example.com"));
}

#[tokio::test]
async fn test_queue_status_tracks_submitted_work() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/queue").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["pool"]["running"], false);
    assert_eq!(response.body["pool"]["workers"], 2);
    assert_eq!(response.body["pool"]["queue"]["pending"], 0);
    assert_eq!(response.body["scheduler"]["active_subscriptions"], 0);

    fixture
        .engine
        .service()
        .submit_order(fixtures::product_spec("alice", &["S2A_001", "S2A_002"]))
        .await
        .unwrap();

    let response = fixture.get("/api/v1/queue").await;
    assert_eq!(response.body["pool"]["queue"]["pending"], 1);

    fixture.engine.pool().drain().await.unwrap();

    let response = fixture.get("/api/v1/queue").await;
    assert_eq!(response.body["pool"]["queue"]["pending"], 0);
    assert!(response.body["pool"]["queue"]["succeeded"].as_i64().unwrap() >= 3);
}

#[tokio::test]
async fn test_queue_status_counts_active_subscriptions() {
    let fixture = TestFixture::new().await;
    let now = Utc::now();

    fixture
        .engine
        .service()
        .submit_order(fixtures::subscription_spec(
            "bob",
            now - Duration::hours(1),
            now + Duration::days(2),
        ))
        .await
        .unwrap();

    let response = fixture.get("/api/v1/queue").await;
    assert_eq!(response.body["scheduler"]["active_subscriptions"], 1);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let fixture = TestFixture::new().await;

    fixture.get("/api/v1/health").await;
    let response = fixture.get("/metrics").await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.text.contains("oseo_http_requests_total"));
    assert!(response.text.contains("oseo_queue_tasks"));
    assert!(response.text.contains("oseo_scheduler_running"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/orders").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_shutdown_completes_after_start() {
    let fixture = TestFixture::new().await;
    fixture.engine.start();
    assert!(fixture.engine.pool().is_running());
    assert!(fixture.engine.scheduler().status().running);

    let TestFixture { router, engine, .. } = fixture;
    drop(router);

    tokio::time::timeout(std::time::Duration::from_secs(3), engine.shutdown())
        .await
        .expect("Engine did not shut down in time");
}
