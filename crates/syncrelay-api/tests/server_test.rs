//! Integration tests for health, stats, admission control, and drain.

mod helpers;

use http::StatusCode;
use http::header::RETRY_AFTER;
use serde_json::json;

#[tokio::test]
async fn test_health_check() {
    let app = helpers::TestApp::new().await;

    let response = app.request("GET", "/health", None, None).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.data()["status"], "ok");
    assert_eq!(response.data()["state"], "running");
    assert_eq!(response.data()["instance_id"], "test-node");
    assert_eq!(response.data()["backends"]["bus"], true);
}

#[tokio::test]
async fn test_stats_and_presence() {
    let app = helpers::TestApp::new().await;
    let token = app.token_for("viewer");

    let response = app.request("GET", "/api/v1/stats", None, Some(&token)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.data()["instance_id"], "test-node");
    assert_eq!(response.data()["connections"], 0);
    assert_eq!(response.data()["bus_backend"], "memory");

    let (handle, _rx) = app.sync.register_connection("carol").await.expect("register");

    let response = app
        .request("GET", "/api/v1/online-users", None, Some(&token))
        .await;
    assert_eq!(response.data()["users"], json!(["carol"]));
    assert_eq!(response.data()["count"], 1);

    let response = app
        .request("GET", "/api/v1/users/carol/online", None, Some(&token))
        .await;
    assert_eq!(response.data()["online"], true);
    assert_eq!(response.data()["local_sessions"], 1);
    let session = &response.data()["sessions"][0];
    assert_eq!(session["id"], handle.id.to_string());
    assert_eq!(session["instance_id"], "test-node");
    assert_eq!(session["alive"], true);

    let response = app
        .request("GET", "/api/v1/users/dave/online", None, Some(&token))
        .await;
    assert_eq!(response.data()["online"], false);

    let response = app
        .request("GET", "/api/v1/stats/pubsub", None, Some(&token))
        .await;
    assert!(response.data()["publisher"].is_object());
    assert!(response.data()["subscriber"].is_object());
}

#[tokio::test]
async fn test_rate_limit_returns_retry_after() {
    let app = helpers::TestApp::with_config(|c| {
        c.rate_limit.api.max_requests = 2;
        c.rate_limit.api.window_seconds = 60;
    })
    .await;
    let token = app.token_for("busy");

    for _ in 0..2 {
        let response = app
            .request("GET", "/api/v1/offline/count", None, Some(&token))
            .await;
        assert_eq!(response.status, StatusCode::OK);
    }

    let response = app
        .request("GET", "/api/v1/offline/count", None, Some(&token))
        .await;
    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.error_code(), "RATE_LIMITED");
    assert!(response.headers.contains_key(RETRY_AFTER));

    // The health check sits outside the limited routes.
    let response = app.request("GET", "/health", None, None).await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_ws_upgrade_requires_websocket_request() {
    let app = helpers::TestApp::new().await;

    let response = app.request("GET", "/ws", None, None).await;

    assert!(
        response.status.is_client_error(),
        "Expected a 4xx, got {}",
        response.status
    );
}

#[tokio::test]
async fn test_drained_instance_refuses_work() {
    let app = helpers::TestApp::new().await;
    let token = app.token_for("late");

    app.sync.shutdown().await;

    let response = app.request("GET", "/health", None, None).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.data()["state"], "stopped");

    let response = app
        .request(
            "POST",
            "/api/v1/events",
            Some(json!({"type": "favorite_added", "payload": {}})),
            Some(&token),
        )
        .await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.error_code(), "SERVICE_UNAVAILABLE");
}
