use axum::{extract::State, http::StatusCode, Json};
use uuid::Uuid;

use crate::api::requests::CreateOrderRequest;
use crate::api::responses::{ApiResponse, ErrorResponse, OrderResponse, ValidationErrorDetail};
use crate::idempotency::MetricsSnapshot;
use crate::observability::AggregatedHealth;

use super::routes::AppState;

/// Health check endpoint.
pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<AggregatedHealth>>) {
    let health = state.health_checker.check_all().await;

    let status = if health.status.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status, Json(ApiResponse::success(health)))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> (StatusCode, String) {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed".to_string()),
    }
}

/// Counters of the idempotency orchestrator.
pub async fn idempotency_stats(State(state): State<AppState>) -> Json<ApiResponse<MetricsSnapshot>> {
    Json(ApiResponse::success(state.orchestrator.metrics().snapshot()))
}

/// Create an order. Mounted behind the idempotency middleware.
pub async fn create_order(
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderResponse>>), (StatusCode, Json<ApiResponse<()>>)> {
    if let Err(errors) = request.validate() {
        let details: Vec<ValidationErrorDetail> = errors
            .iter()
            .map(|e| ValidationErrorDetail {
                field: e.field.clone(),
                message: e.message.clone(),
            })
            .collect();

        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<()>::error(
                ErrorResponse::new("VALIDATION_ERROR", "Request validation failed")
                    .with_details(details),
            )),
        ));
    }

    let order = OrderResponse {
        order_id: Uuid::new_v4(),
        item: request.item,
        quantity: request.quantity,
        customer_reference: request.customer_reference,
        created_at: chrono::Utc::now(),
    };
    tracing::info!(order_id = %order.order_id, "Order created");

    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}
