//! Common test utilities for in-process router testing.
//!
//! Builds a full engine against a temporary database with the mock
//! processing plugin and a recording notifier, and exposes its operations
//! router.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use oseo_core::testing::{MockProcessor, RecordingNotifier};
use oseo_server::{api::create_router, Engine};

/// Re-export fixtures for test convenience
pub use oseo_core::testing::fixtures;

/// In-process engine plus its operations router.
pub struct TestFixture {
    pub router: Router,
    pub engine: Engine,
    pub plugin: Arc<MockProcessor>,
    pub notifier: RecordingNotifier,
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
    pub text: String,
}

impl TestFixture {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = fixtures::test_config();
        config.database.path = temp_dir.path().join("oseo.db");

        let plugin = Arc::new(MockProcessor::new());
        let notifier = RecordingNotifier::new();
        let engine = Engine::with_components(config, plugin.clone(), Arc::new(notifier.clone()))
            .expect("Failed to build engine");
        let router = create_router(engine.app_state());

        Self {
            router,
            engine,
            plugin,
            notifier,
            temp_dir,
        }
    }

    /// Send a GET request to the router.
    pub async fn get(&self, path: &str) -> TestResponse {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .expect("Failed to build request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let body = serde_json::from_str(&text).unwrap_or(Value::Null);

        TestResponse { status, body, text }
    }
}
