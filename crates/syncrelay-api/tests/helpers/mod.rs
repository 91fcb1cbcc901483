//! Shared test helpers for API integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use http::{HeaderMap, Request, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use syncrelay_api::AppState;
use syncrelay_auth::JwtEncoder;
use syncrelay_cache::Backends;
use syncrelay_core::config::AppConfig;
use syncrelay_realtime::SyncManager;

/// Test application context
pub struct TestApp {
    /// The Axum router for making test requests
    pub router: Router,
    /// The running sync manager behind the router
    pub sync: Arc<SyncManager>,
    /// Application config
    pub config: AppConfig,
}

impl TestApp {
    /// Create a test application on in-memory backends.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Like [`new`](Self::new), after applying `tweak` to the default config.
    pub async fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let mut config = AppConfig::default();
        config.auth.jwt_secret = "integration-test-secret-0123456789".to_string();
        config.sync.instance_id = "test-node".to_string();
        tweak(&mut config);
        config.validate().expect("valid test config");

        let sync = Arc::new(
            SyncManager::new(
                config.sync.clone(),
                &config.bus,
                Backends::in_memory(config.bus.memory_buffer_size),
            )
            .await,
        );
        sync.start(CancellationToken::new())
            .await
            .expect("Failed to start sync manager");

        let state = AppState::new(config.clone(), sync.clone());
        let router = syncrelay_api::router::build_router(state);

        Self {
            router,
            sync,
            config,
        }
    }

    /// Issue an access token for `user_id`.
    pub fn token_for(&self, user_id: &str) -> String {
        JwtEncoder::new(&self.config.auth)
            .generate_access_token(user_id)
            .expect("Failed to issue token")
            .0
    }

    /// Make an HTTP request to the test app
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> TestResponse {
        let body_str = body
            .map(|b| serde_json::to_string(&b).expect("Failed to serialize body"))
            .unwrap_or_default();

        let mut req = Request::builder()
            .method(method)
            .uri(path)
            .header("Content-Type", "application/json");

        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        let req = req
            .body(Body::from(body_str))
            .expect("Failed to build request");

        let response = self
            .router
            .clone()
            .oneshot(req)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let headers = response.headers().clone();
        let body_bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("Failed to read body");

        let body: Value = serde_json::from_slice(&body_bytes).unwrap_or(Value::Null);

        TestResponse {
            status,
            headers,
            body,
        }
    }
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Parsed JSON body
    pub body: Value,
}

impl TestResponse {
    /// The `data` field of a success envelope.
    pub fn data(&self) -> &Value {
        &self.body["data"]
    }

    /// The `error` code of an error body.
    pub fn error_code(&self) -> &str {
        self.body["error"].as_str().unwrap_or_default()
    }
}
