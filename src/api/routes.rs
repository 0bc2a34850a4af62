use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use super::handlers;
use super::middleware::{idempotency_middleware, track_http_metrics};
use crate::idempotency::RequestOrchestrator;
use crate::observability::HealthChecker;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RequestOrchestrator>,
    pub health_checker: Arc<HealthChecker>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(orchestrator: Arc<RequestOrchestrator>, health_checker: Arc<HealthChecker>) -> Self {
        Self {
            orchestrator,
            health_checker,
            metrics_handle: None,
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

/// Creates the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/orders", post(handlers::create_order))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.orchestrator),
            idempotency_middleware,
        ));

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoints
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/idempotency/stats", get(handlers::idempotency_stats))
        .merge(protected)
        .route_layer(middleware::from_fn(track_http_metrics))
        .with_state(state)
}
