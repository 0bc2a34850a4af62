use axum::{
    body::{to_bytes, Body},
    extract::{MatchedPath, Request, State},
    http::{header, response::Parts, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use http_body_util::LengthLimitError;
use std::sync::Arc;

use crate::api::responses::{ApiResponse, ErrorResponse};
use crate::error::AppError;
use crate::idempotency::{
    fingerprint, CachedResponse, CapturedResponse, IdempotencyOutcome, IdempotentRequest,
    InvalidKey, RequestOrchestrator,
};
use crate::observability::{get_metrics, LatencyTimer};

pub const IDEMPOTENCY_STATUS_HEADER: HeaderName = HeaderName::from_static("idempotency-status");
pub const IDEMPOTENCY_EXPIRES_HEADER: HeaderName = HeaderName::from_static("idempotency-expires");

/// Safe methods never change state and bypass deduplication.
pub fn is_state_changing(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
}

fn exceeds_body_limit(error: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(current) = source {
        if current.is::<LengthLimitError>() {
            return true;
        }
        source = current.source();
    }
    false
}

/// Runs the wrapped route through the orchestrator.
///
/// Mount with `route_layer` so `MatchedPath` is available; the raw URI path
/// is used otherwise.
pub async fn idempotency_middleware(
    State(orchestrator): State<Arc<RequestOrchestrator>>,
    request: Request,
    next: Next,
) -> Response {
    if !is_state_changing(request.method()) {
        return next.run(request).await;
    }

    let config = orchestrator.config();

    // Header values that are not visible ASCII still reach the validator so
    // the rejection names the offending character.
    let raw_key = request
        .headers()
        .get(config.header_name.as_str())
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());

    if raw_key.is_none() && !config.require_key {
        return next.run(request).await;
    }

    let route_template = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().as_str().to_string();

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) if exceeds_body_limit(&e) => {
            tracing::warn!("Rejected request body: {}", e);
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                format!("Request body exceeds {} bytes", config.max_body_bytes),
            );
        }
        Err(e) => {
            tracing::warn!("Failed to read request body: {}", e);
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST_BODY",
                "Request body could not be read",
            );
        }
    };
    let idempotent_request =
        IdempotentRequest::new(method, route_template, raw_key).with_fingerprint(fingerprint(&bytes));
    let request = Request::from_parts(parts, Body::from(bytes));

    let mut executed_parts: Option<Parts> = None;
    let slot = &mut executed_parts;

    let result = orchestrator
        .execute(idempotent_request, move || async move {
            let response = next.run(request).await;
            let (parts, body) = response.into_parts();
            let bytes = to_bytes(body, usize::MAX)
                .await
                .map_err(|e| AppError::Downstream(e.to_string()))?;
            let content_type = parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let captured = CapturedResponse::new(parts.status.as_u16(), content_type, bytes.to_vec());
            *slot = Some(parts);
            Ok(captured)
        })
        .await;

    match result {
        Ok(outcome) => outcome_response(outcome, executed_parts),
        Err(AppError::StoreUnavailable(e)) => {
            tracing::error!("Idempotency store unavailable: {}", e);
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "IDEMPOTENCY_STORE_UNAVAILABLE",
                "Idempotency store is unavailable, retry later",
            )
        }
        Err(e) => {
            tracing::error!("Protected operation failed: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred",
            )
        }
    }
}

fn outcome_response(outcome: IdempotencyOutcome, parts: Option<Parts>) -> Response {
    match outcome {
        IdempotencyOutcome::RejectedInvalidKey(reason) => invalid_key_response(&reason),
        IdempotencyOutcome::ReplayedFromCache(cached) => replay_response(&cached),
        IdempotencyOutcome::ExecutedAndCached { response, expires_at } => {
            let mut response = executed_response(response, parts);
            set_status_header(&mut response, "created");
            set_expires_header(&mut response, expires_at);
            response
        }
        IdempotencyOutcome::ExecutedUncached { response, reason } => {
            tracing::debug!(?reason, "Response returned without caching");
            let mut response = executed_response(response, parts);
            set_status_header(&mut response, "created");
            response
        }
        IdempotencyOutcome::Conflict { retry_after } => {
            let mut response = error_response(
                StatusCode::CONFLICT,
                "IDEMPOTENCY_CONFLICT",
                "A request with this idempotency key is already being processed",
            );
            let seconds = retry_after.as_secs().max(1);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
            response
        }
        IdempotencyOutcome::FingerprintMismatch => error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "IDEMPOTENCY_KEY_REUSED",
            "Idempotency key was already used with a different request body",
        ),
    }
}

fn invalid_key_response(reason: &InvalidKey) -> Response {
    error_response(StatusCode::BAD_REQUEST, "INVALID_IDEMPOTENCY_KEY", reason.to_string())
}

fn replay_response(cached: &CachedResponse) -> Response {
    let captured = cached.to_captured();
    let mut response = Response::new(Body::from(captured.body));
    *response.status_mut() =
        StatusCode::from_u16(captured.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if let Some(value) = captured
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    set_status_header(&mut response, "cached");
    set_expires_header(&mut response, cached.expires_at);
    response
}

/// Rebuilds the downstream response, keeping its original headers when they
/// were captured during execution.
fn executed_response(captured: CapturedResponse, parts: Option<Parts>) -> Response {
    match parts {
        Some(parts) => Response::from_parts(parts, Body::from(captured.body)),
        None => {
            let mut response = Response::new(Body::from(captured.body));
            *response.status_mut() =
                StatusCode::from_u16(captured.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if let Some(value) = captured
                .content_type
                .as_deref()
                .and_then(|ct| HeaderValue::from_str(ct).ok())
            {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            response
        }
    }
}

fn set_status_header(response: &mut Response, status: &'static str) {
    response
        .headers_mut()
        .insert(IDEMPOTENCY_STATUS_HEADER, HeaderValue::from_static(status));
}

fn set_expires_header(response: &mut Response, expires_at: DateTime<Utc>) {
    if let Ok(value) = HeaderValue::from_str(&expires_at.to_rfc3339()) {
        response.headers_mut().insert(IDEMPOTENCY_EXPIRES_HEADER, value);
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(ApiResponse::<()>::error(ErrorResponse::new(code, message)))).into_response()
}

/// Records request count and latency per route template.
pub async fn track_http_metrics(request: Request, next: Next) -> Response {
    let timer = LatencyTimer::new();
    let method = request.method().as_str().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    get_metrics().record_http_request(&method, &path, response.status().as_u16(), timer.elapsed_ms());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_methods_bypass() {
        assert!(!is_state_changing(&Method::GET));
        assert!(!is_state_changing(&Method::HEAD));
        assert!(!is_state_changing(&Method::OPTIONS));
        assert!(!is_state_changing(&Method::TRACE));
        assert!(is_state_changing(&Method::POST));
        assert!(is_state_changing(&Method::PUT));
        assert!(is_state_changing(&Method::PATCH));
        assert!(is_state_changing(&Method::DELETE));
    }

    #[test]
    fn test_conflict_carries_retry_after() {
        let response = outcome_response(
            IdempotencyOutcome::Conflict {
                retry_after: std::time::Duration::from_secs(30),
            },
            None,
        );
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
    }

    #[test]
    fn test_replay_restores_status_and_headers() {
        let cached = CachedResponse::from_captured(
            &CapturedResponse::new(201, Some("application/json".to_string()), r#"{"orderId":"X"}"#),
            chrono::Duration::hours(1),
            None,
        )
        .unwrap();

        let response = outcome_response(IdempotencyOutcome::ReplayedFromCache(cached.clone()), None);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()[IDEMPOTENCY_STATUS_HEADER], "cached");
        assert_eq!(
            response.headers()[IDEMPOTENCY_EXPIRES_HEADER],
            cached.expires_at.to_rfc3339().as_str()
        );
    }

    #[test]
    fn test_invalid_key_is_bad_request() {
        let response = outcome_response(IdempotencyOutcome::RejectedInvalidKey(InvalidKey::Empty), None);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(IDEMPOTENCY_STATUS_HEADER).is_none());
    }
}
