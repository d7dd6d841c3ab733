//! Operational listener surface: metrics exposition and health endpoints.
//!
//! These routes live on their own listener so application traffic and
//! operational traffic never share a port, and none of them pass
//! through the application middleware chain.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::error;

use crate::config::ServiceConfig;
use crate::health::HealthRegistry;
use crate::metrics::MetricsRegistry;

/// Build the operational router from the configured paths.
///
/// Health and readiness evaluations are bounded by the configured read
/// timeout so a stuck probe cannot hold an operational request open.
pub fn ops_router(
    config: &ServiceConfig,
    metrics: Arc<MetricsRegistry>,
    health: Arc<HealthRegistry>,
) -> Router {
    let deadline = config.read_timeout();

    Router::new()
        .route(
            &config.metrics_path,
            get(move || metrics_text(Arc::clone(&metrics))),
        )
        .route(&config.health_path, {
            let health = Arc::clone(&health);
            get(move || {
                let health = Arc::clone(&health);
                async move { health.evaluate(deadline).await.into_response() }
            })
        })
        .route(&config.readiness_path, {
            let health = Arc::clone(&health);
            get(move || readiness(Arc::clone(&health), deadline))
        })
        .route(
            &config.liveness_path,
            get(move || liveness(Arc::clone(&health))),
        )
}

/// Prometheus text exposition for everything in the owned registry.
async fn metrics_text(metrics: Arc<MetricsRegistry>) -> Response {
    match metrics.export_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response()
        }
    }
}

async fn readiness(health: Arc<HealthRegistry>, deadline: Duration) -> Response {
    if health.is_ready(deadline).await {
        (StatusCode::OK, "Ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not Ready").into_response()
    }
}

async fn liveness(health: Arc<HealthRegistry>) -> Response {
    if health.is_live() {
        (StatusCode::OK, "Alive").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not Alive").into_response()
    }
}
