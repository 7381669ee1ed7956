//! Prometheus metrics endpoint

use std::sync::Arc;

use axum::{Router, extract::State, http::header, response::IntoResponse, routing::get};

use super::ApiState;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

async fn metrics(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let sessions = state.connections.count().await;
    (
        [(header::CONTENT_TYPE, CONTENT_TYPE)],
        state.coordinator.metrics().render(sessions),
    )
}

/// Build the metrics router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(state)
}
