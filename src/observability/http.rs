//! HTTP health endpoint.
//!
//! Provides:
//! - `/health` - JSON health snapshot
//! - `/ready` - Readiness check

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use tokio::sync::watch;

use super::health::HealthReporter;

/// Create the health HTTP router.
pub fn create_router(reporter: HealthReporter) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(reporter)
}

/// Handle GET /health - current snapshot as JSON.
async fn health_handler(State(reporter): State<HealthReporter>) -> Response {
    match tokio::task::spawn_blocking(move || reporter.snapshot()).await {
        Ok(Ok(snapshot)) => (StatusCode::OK, Json(snapshot)).into_response(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Health snapshot failed");
            (StatusCode::SERVICE_UNAVAILABLE, format!("queue unavailable: {e}")).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Health snapshot task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Handle GET /ready - Readiness check.
async fn ready_handler() -> impl IntoResponse {
    (StatusCode::OK, "READY")
}

/// Run the health HTTP server until `shutdown_rx` changes.
pub async fn run_health_server(
    addr: SocketAddr,
    reporter: HealthReporter,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(reporter);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Starting health server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            tracing::info!("Health server shutting down");
        })
        .await?;

    Ok(())
}
