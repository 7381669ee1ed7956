//! HTTP and WebSocket API for companion devices

pub mod health;
pub mod metrics;
pub mod websocket;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::Result;
use crate::db::DbPool;
use crate::pipeline::SessionCoordinator;

/// Live device connections, one per device id
///
/// A device that reconnects replaces its previous connection.
#[derive(Clone, Default)]
pub struct Connections {
    inner: Arc<RwLock<HashMap<String, (Uuid, CancellationToken)>>>,
}

impl Connections {
    /// Register a connection for a device, cancelling any previous one
    pub async fn register(&self, device_id: &str) -> (Uuid, CancellationToken) {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let previous = self
            .inner
            .write()
            .await
            .insert(device_id.to_string(), (id, token.clone()));

        if let Some((old_id, old)) = previous {
            tracing::info!(device_id = %device_id, replaced = %old_id, "device reconnected");
            old.cancel();
        }

        (id, token)
    }

    /// Forget a connection unless a newer one already replaced it
    pub async fn release(&self, device_id: &str, id: Uuid) {
        let mut map = self.inner.write().await;
        if map.get(device_id).is_some_and(|(current, _)| *current == id) {
            map.remove(device_id);
        }
    }

    /// Number of connected devices
    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub coordinator: Arc<SessionCoordinator>,
    pub connections: Connections,
}

impl ApiState {
    /// Create API state
    #[must_use]
    pub fn new(db: DbPool, coordinator: SessionCoordinator) -> Self {
        Self {
            db,
            coordinator: Arc::new(coordinator),
            connections: Connections::default(),
        }
    }
}

/// Build the router with all routes
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/ws", websocket::router(state.clone()))
        .merge(health::router(state.clone()))
        .merge(metrics::router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    addr: String,
}

impl ApiServer {
    /// Create a server bound to `addr` once run
    #[must_use]
    pub fn new(state: ApiState, addr: impl Into<String>) -> Self {
        Self {
            state: Arc::new(state),
            addr: addr.into(),
        }
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(addr = %self.addr, "API server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown.cancelled_owned()).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reconnect_replaces_previous() {
        let connections = Connections::default();
        let (first_id, first) = connections.register("device-1").await;
        let (second_id, second) = connections.register("device-1").await;

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(connections.count().await, 1);

        // The stale connection's release must not evict the new one
        connections.release("device-1", first_id).await;
        assert_eq!(connections.count().await, 1);

        connections.release("device-1", second_id).await;
        assert_eq!(connections.count().await, 0);
    }
}
