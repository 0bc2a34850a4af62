use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    middleware,
    response::Response,
    routing::post,
    Json, Router,
};
use idempotency_engine::api::responses::{ApiResponse, ErrorResponse};
use idempotency_engine::api::{create_router, idempotency_middleware, AppState};
use idempotency_engine::config::{ConflictPolicy, FingerprintPolicy, IdempotencySettings};
use idempotency_engine::error::{Result, StoreError};
use idempotency_engine::idempotency::{
    CachedResponse, CompositeKey, InMemoryLockCoordinator, InMemoryResponseStore, LockCoordinator,
    RequestOrchestrator, ResponseStore, WriteOutcome,
};
use idempotency_engine::observability::HealthChecker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tower::ServiceExt;

struct UnreachableStore;

#[async_trait]
impl ResponseStore for UnreachableStore {
    async fn try_get(&self, _key: &CompositeKey) -> Result<Option<CachedResponse>> {
        Err(StoreError::Backend("connection refused".to_string()).into())
    }

    async fn try_set(&self, _key: &CompositeKey, _response: &CachedResponse) -> Result<WriteOutcome> {
        Err(StoreError::Backend("connection refused".to_string()).into())
    }

    fn backend_name(&self) -> &'static str {
        "unreachable"
    }
}

fn orchestrator(settings: IdempotencySettings) -> Arc<RequestOrchestrator> {
    let locks: Arc<dyn LockCoordinator> = Arc::new(InMemoryLockCoordinator::new());
    Arc::new(RequestOrchestrator::new(
        Arc::new(InMemoryResponseStore::new()),
        Some(locks),
        settings,
    ))
}

fn app(settings: IdempotencySettings) -> Router {
    let state = AppState::new(orchestrator(settings), Arc::new(HealthChecker::new(None, None)));
    create_router(state)
}

/// Router whose protected routes count how often they really run.
fn counting_app(orchestrator: Arc<RequestOrchestrator>, calls: Arc<AtomicUsize>) -> Router {
    let handler = move || {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            (StatusCode::CREATED, Json(serde_json::json!({ "orderId": "X" })))
        }
    };

    Router::new()
        .route("/orders", post(handler.clone()))
        .route("/invoices", post(handler))
        .route_layer(middleware::from_fn_with_state(orchestrator, idempotency_middleware))
}

fn post_request(uri: &str, key: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header("Idempotency-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_string(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn header_value<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

const ORDER: &str = r#"{"item":"widget","quantity":2}"#;

#[tokio::test]
async fn test_retry_replays_first_response() {
    let app = app(IdempotencySettings::default());

    let first = app
        .clone()
        .oneshot(post_request("/orders", Some("abc-123"), ORDER))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    assert_eq!(header_value(&first, "idempotency-status"), Some("created"));
    assert!(header_value(&first, "idempotency-expires").is_some());
    let first_body = body_string(first).await;

    let second = app
        .oneshot(post_request("/orders", Some("abc-123"), ORDER))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    assert_eq!(header_value(&second, "idempotency-status"), Some("cached"));
    assert_eq!(header_value(&second, "content-type"), Some("application/json"));
    let expires = header_value(&second, "idempotency-expires").expect("expiry header");
    assert!(chrono::DateTime::parse_from_rfc3339(expires).is_ok());
    assert_eq!(body_string(second).await, first_body);
}

#[tokio::test]
async fn test_missing_key_is_rejected() {
    let response = app(IdempotencySettings::default())
        .oneshot(post_request("/orders", None, ORDER))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ApiResponse<()> = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body.error.unwrap().code, "INVALID_IDEMPOTENCY_KEY");
}

#[tokio::test]
async fn test_malformed_key_is_rejected() {
    let app = app(IdempotencySettings::default());

    for key in ["has space", "semi;colon", "k".repeat(257).as_str()] {
        let response = app
            .clone()
            .oneshot(post_request("/orders", Some(key), ORDER))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "key {:?}", key);
    }
}

#[tokio::test]
async fn test_missing_key_passes_when_not_required() {
    let settings = IdempotencySettings {
        require_key: false,
        ..Default::default()
    };

    let response = app(settings)
        .oneshot(post_request("/orders", None, ORDER))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.headers().get("idempotency-status").is_none());
}

#[tokio::test]
async fn test_health_endpoints_bypass_idempotency() {
    let app = app(IdempotencySettings::default());

    for uri in ["/health", "/ready", "/live"] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{}", uri);
    }
}

#[tokio::test]
async fn test_validation_errors_are_not_cached_by_default() {
    let app = app(IdempotencySettings::default());
    let invalid = r#"{"item":"","quantity":0}"#;

    let first = app
        .clone()
        .oneshot(post_request("/orders", Some("fix-and-retry"), invalid))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::BAD_REQUEST);
    assert_eq!(header_value(&first, "idempotency-status"), Some("created"));

    let corrected = app
        .oneshot(post_request("/orders", Some("fix-and-retry"), ORDER))
        .await
        .unwrap();
    assert_eq!(corrected.status(), StatusCode::CREATED);
    assert_eq!(header_value(&corrected, "idempotency-status"), Some("created"));
}

#[tokio::test]
async fn test_simultaneous_requests_reach_handler_once() {
    let settings = IdempotencySettings {
        conflict_policy: ConflictPolicy::WaitAndPoll,
        poll_attempts: 100,
        poll_interval_ms: 10,
        ..Default::default()
    };
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counting_app(orchestrator(settings), Arc::clone(&calls));

    let (a, b) = tokio::join!(
        app.clone().oneshot(post_request("/orders", Some("abc-123"), ORDER)),
        app.clone().oneshot(post_request("/orders", Some("abc-123"), ORDER)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.status(), StatusCode::CREATED);
    assert_eq!(b.status(), StatusCode::CREATED);
    assert_eq!(body_string(a).await, r#"{"orderId":"X"}"#);
    assert_eq!(body_string(b).await, r#"{"orderId":"X"}"#);
}

#[tokio::test]
async fn test_same_key_on_other_route_executes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counting_app(orchestrator(IdempotencySettings::default()), Arc::clone(&calls));

    let orders = app
        .clone()
        .oneshot(post_request("/orders", Some("abc-123"), ORDER))
        .await
        .unwrap();
    let invoices = app
        .oneshot(post_request("/invoices", Some("abc-123"), ORDER))
        .await
        .unwrap();

    assert_eq!(header_value(&orders, "idempotency-status"), Some("created"));
    assert_eq!(header_value(&invoices, "idempotency-status"), Some("created"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_in_flight_duplicate_gets_conflict() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let handler = {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        move || {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            async move {
                started.notify_one();
                release.notified().await;
                (StatusCode::CREATED, "done")
            }
        }
    };
    let app = Router::new()
        .route("/orders", post(handler))
        .route_layer(middleware::from_fn_with_state(
            orchestrator(IdempotencySettings::default()),
            idempotency_middleware,
        ));

    let first = tokio::spawn(
        app.clone()
            .oneshot(post_request("/orders", Some("slow-key"), ORDER)),
    );
    started.notified().await;

    let second = app
        .clone()
        .oneshot(post_request("/orders", Some("slow-key"), ORDER))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    assert_eq!(header_value(&second, "retry-after"), Some("30"));

    release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_reused_key_with_different_body_is_rejected() {
    let settings = IdempotencySettings {
        fingerprint_policy: FingerprintPolicy::Reject,
        ..Default::default()
    };
    let app = app(settings);

    let first = app
        .clone()
        .oneshot(post_request("/orders", Some("fp-key"), ORDER))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let same = app
        .clone()
        .oneshot(post_request("/orders", Some("fp-key"), ORDER))
        .await
        .unwrap();
    assert_eq!(same.status(), StatusCode::CREATED);

    let different = app
        .oneshot(post_request("/orders", Some("fp-key"), r#"{"item":"gadget","quantity":9}"#))
        .await
        .unwrap();
    assert_eq!(different.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_store_outage_fails_closed_with_service_unavailable() {
    let orchestrator = Arc::new(RequestOrchestrator::new(
        Arc::new(UnreachableStore),
        None,
        IdempotencySettings::default(),
    ));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counting_app(orchestrator, Arc::clone(&calls));

    let response = app
        .oneshot(post_request("/orders", Some("abc-123"), ORDER))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_store_outage_fails_open_when_configured() {
    let settings = IdempotencySettings {
        fail_open: true,
        ..Default::default()
    };
    let orchestrator = Arc::new(RequestOrchestrator::new(Arc::new(UnreachableStore), None, settings));
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counting_app(orchestrator, Arc::clone(&calls));

    let response = app
        .oneshot(post_request("/orders", Some("abc-123"), ORDER))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_value(&response, "idempotency-status"), Some("created"));
    assert!(response.headers().get("idempotency-expires").is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let settings = IdempotencySettings {
        max_body_bytes: 16,
        ..Default::default()
    };
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counting_app(orchestrator(settings), Arc::clone(&calls));

    let response = app
        .oneshot(post_request("/orders", Some("big-body"), &"x".repeat(64)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_broken_body_stream_is_bad_request() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counting_app(orchestrator(IdempotencySettings::default()), Arc::clone(&calls));

    let chunks: Vec<std::result::Result<&'static str, std::io::Error>> = vec![
        Ok(r#"{"item":"#),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "client went away")),
    ];
    let request = Request::builder()
        .method("POST")
        .uri("/orders")
        .header(header::CONTENT_TYPE, "application/json")
        .header("Idempotency-Key", "broken-stream")
        .body(Body::from_stream(futures::stream::iter(chunks)))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ApiResponse<()> = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body.error.unwrap().code, "INVALID_REQUEST_BODY");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_error_response_serialization() {
    let response = ApiResponse::<()>::error(ErrorResponse::new("IDEMPOTENCY_CONFLICT", "busy"));
    let json = serde_json::to_string(&response).unwrap();
    assert!(json.contains("\"success\":false"));
    assert!(json.contains("\"code\":\"IDEMPOTENCY_CONFLICT\""));
}
