use idempotency_engine::observability::{
    mask_key, mask_sensitive, AggregatedHealth, DependencyHealth, HealthChecker, HealthStatus,
    LatencyTimer, LogConfig, LogFormat, Metrics,
};
use tokio_test::assert_ok;

#[test]
fn test_log_config_default() {
    let config = LogConfig::default();
    assert_eq!(config.level, "info");
    assert!(config.include_target);
    assert!(!config.include_file);
    assert!(!config.include_line);
}

#[test]
fn test_log_format_from_str() {
    assert_eq!(LogFormat::from("json"), LogFormat::Json);
    assert_eq!(LogFormat::from("JSON"), LogFormat::Json);
    assert_eq!(LogFormat::from("compact"), LogFormat::Compact);
    assert_eq!(LogFormat::from("COMPACT"), LogFormat::Compact);
    assert_eq!(LogFormat::from("pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::from("unknown"), LogFormat::Pretty);
}

#[test]
fn test_mask_sensitive_short_string() {
    let result = mask_sensitive("abc", 2);
    assert_eq!(result, "***");
}

#[test]
fn test_mask_sensitive_long_string() {
    let result = mask_sensitive("1234567890", 2);
    assert_eq!(result, "12******90");
}

#[test]
fn test_mask_sensitive_exact_boundary() {
    let result = mask_sensitive("1234", 2);
    assert_eq!(result, "****");
}

#[test]
fn test_mask_key_keeps_edges() {
    let masked = mask_key("order-2026-abcdef");
    assert!(masked.starts_with("orde"));
    assert!(masked.ends_with("cdef"));
    assert_eq!(masked.chars().count(), 17);
}

#[test]
fn test_mask_key_short_key_fully_masked() {
    assert_eq!(mask_key("abc-123"), "*******");
}

#[test]
fn test_log_config_from_settings_values() {
    let config = LogConfig::new("debug", "json");
    assert_eq!(config.level, "debug");
    assert_eq!(config.format, LogFormat::Json);
}

#[test]
fn test_metrics_idempotency_recording() {
    let metrics = Metrics::new();
    metrics.record_idempotency_outcome("replayed");
    metrics.record_idempotency_outcome("executed_cached");
    metrics.record_lock_acquisition(true);
    metrics.record_lock_acquisition(false);
}

#[test]
fn test_metrics_store_and_sweep_recording() {
    let metrics = Metrics::new();
    metrics.record_store_operation("redis", "try_get", 1.0, true);
    metrics.record_store_operation("postgres", "try_set", 8.5, false);
    metrics.record_sweep(250, 42.0);
}

#[test]
fn test_metrics_http_request() {
    let metrics = Metrics::new();
    metrics.record_http_request("GET", "/health", 200, 5.0);
    metrics.record_http_request("POST", "/orders", 201, 50.0);
    metrics.record_http_request("POST", "/orders", 409, 2.0);
}

#[test]
fn test_latency_timer() {
    let timer = LatencyTimer::new();
    std::thread::sleep(std::time::Duration::from_millis(10));
    let elapsed = timer.elapsed_ms();
    assert!(elapsed >= 10.0);
    assert!(elapsed < 100.0);
}

#[test]
fn test_backend_health_serialization() {
    let health = AggregatedHealth::new(
        "0.1.0".to_string(),
        100,
        vec![
            DependencyHealth::answered("postgres", 5.5, 100.0),
            DependencyHealth::unhealthy("redis", "Connection refused"),
        ],
    );
    let json = assert_ok!(serde_json::to_string(&health));

    assert!(json.contains("\"status\":\"unhealthy\""));
    assert!(json.contains("\"name\":\"postgres\""));
    assert!(json.contains("\"latency_ms\":5.5"));
    assert!(json.contains("\"uptime_seconds\":100"));
}

#[tokio::test]
async fn test_health_checker_without_backends() {
    let checker = HealthChecker::new(None, None);
    let health = checker.check_all().await;

    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(checker.is_alive());
    assert!(checker.is_ready().await);
}

#[tokio::test]
async fn test_unreachable_redis_is_not_ready() {
    let client = assert_ok!(redis::Client::open("redis://127.0.0.1:1"));
    let checker = HealthChecker::new(None, Some(client));
    let health = checker.check_all().await;

    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.dependencies.len(), 1);
    assert_eq!(health.dependencies[0].name, "redis");
    assert!(health.dependencies[0].message.is_some());
    assert!(!checker.is_ready().await);
}
