//! Health check HTTP server.

use std::net::SocketAddr;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::aggregator::HealthAggregator;
use crate::config::HealthCheckConfig;
use crate::error::HealthError;

/// Shared state for the health route.
#[derive(Clone)]
struct HealthRouteState {
    aggregator: HealthAggregator,
}

/// Build the router serving aggregate health at `path`.
pub fn health_routes(aggregator: HealthAggregator, path: &str) -> Router {
    Router::new()
        .route(path, get(health_handler))
        .with_state(HealthRouteState { aggregator })
}

/// Always 200 when the body encodes; callers read `ok` from the body.
async fn health_handler(State(state): State<HealthRouteState>) -> Response {
    let snapshot = state.aggregator.snapshot().await;
    if !snapshot.ok {
        tracing::debug!(failed = ?snapshot.failed_jobs, "Health check reports failed tasks");
    }

    match serde_json::to_vec(&snapshot) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to marshal JSON: {e}"),
        )
            .into_response(),
    }
}

/// A bound health listener, ready to serve.
pub struct HealthServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
}

impl HealthServer {
    /// Bind the configured address. Failure here is fatal to the worker.
    pub async fn bind(
        config: &HealthCheckConfig,
        aggregator: HealthAggregator,
    ) -> Result<Self, HealthError> {
        let addr = config.addr();
        let bind_err = |source| HealthError::Bind {
            addr: addr.clone(),
            source,
        };

        let listener = TcpListener::bind(&addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        Ok(Self {
            listener,
            local_addr,
            router: health_routes(aggregator, &config.path),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), HealthError> {
        tracing::info!(addr = %self.local_addr, "Health check server listening");
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(HealthError::Serve)
    }
}
