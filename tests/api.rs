//! API endpoint integration tests

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use companion_gateway::DbPool;
use companion_gateway::api::{self, ApiState};
use companion_gateway::backends::Backends;
use companion_gateway::pipeline::{PipelineConfig, SessionCoordinator, Store};
use tower::ServiceExt;

mod common;
use common::{JitterSynthesizer, ScriptedModel, ScriptedTranscriber, setup_test_db};

/// Build a test API router
fn build_test_router(db: DbPool) -> axum::Router {
    let backends = Backends {
        transcriber: Arc::new(ScriptedTranscriber::always("hello")),
        model: Arc::new(ScriptedModel::tokens(&["Hi."])),
        synthesizer: Arc::new(JitterSynthesizer::new(0)),
        voice: "test-voice".to_string(),
    };
    let store = Store::new(&db, "user-test");
    let coordinator = SessionCoordinator::new(backends, store, PipelineConfig::default());

    api::router(Arc::new(ApiState::new(db, coordinator)))
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or_default())
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = build_test_router(setup_test_db());
    let (status, json) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_ready_endpoint() {
    let app = build_test_router(setup_test_db());
    let (status, json) = get_json(app, "/ready").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["checks"]["database"]["status"], "ok");
    assert_eq!(json["sessions"], 0);
}

#[tokio::test]
async fn test_websocket_requires_upgrade() {
    let app = build_test_router(setup_test_db());
    let (status, _) = get_json(app, "/ws/device-1").await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_unknown_route() {
    let app = build_test_router(setup_test_db());
    let (status, _) = get_json(app, "/api/nothing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = build_test_router(setup_test_db());
    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; version=0.0.4"
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("companion_active_sessions 0\n"));
    assert!(text.contains("# TYPE companion_pipeline_latency_ms histogram"));
    assert!(text.contains("companion_llm_fallback_total 0\n"));
}
