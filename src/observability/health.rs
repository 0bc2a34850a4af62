use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::{Duration, Instant};

/// Health status of the engine or one of its backends.
///
/// Ordered from best to worst so the aggregate is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Result of probing one response store or lock backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    /// Classifies a successful probe by its round-trip time.
    pub fn answered(name: impl Into<String>, latency_ms: f64, slow_after_ms: f64) -> Self {
        let slow = latency_ms > slow_after_ms;
        Self {
            name: name.into(),
            status: if slow { HealthStatus::Degraded } else { HealthStatus::Healthy },
            latency_ms: Some(latency_ms),
            message: slow.then(|| format!("Latency above {}ms", slow_after_ms)),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

/// Health of the running engine across every configured backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = dependencies
            .iter()
            .map(|d| d.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            version,
            uptime_seconds,
            dependencies,
        }
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const POSTGRES_SLOW_MS: f64 = 100.0;
const REDIS_SLOW_MS: f64 = 50.0;

/// Probes whichever of Postgres and Redis the engine was wired with.
///
/// The in-memory backend has nothing to probe, so a checker without
/// backends always reports healthy.
pub struct HealthChecker {
    pool: Option<PgPool>,
    redis_client: Option<redis::Client>,
    start_time: Instant,
}

impl HealthChecker {
    pub fn new(pool: Option<PgPool>, redis_client: Option<redis::Client>) -> Self {
        Self {
            pool,
            redis_client,
            start_time: Instant::now(),
        }
    }

    pub async fn check_all(&self) -> AggregatedHealth {
        let mut dependencies = Vec::new();

        if let Some(pool) = &self.pool {
            dependencies.push(probe_postgres(pool).await);
        }
        if let Some(client) = &self.redis_client {
            dependencies.push(probe_redis(client).await);
        }

        AggregatedHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.uptime_seconds(),
            dependencies,
        )
    }

    pub fn is_alive(&self) -> bool {
        true
    }

    /// Ready while no configured backend is down. Slow backends still count.
    pub async fn is_ready(&self) -> bool {
        !self.check_all().await.status.is_unhealthy()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

async fn probe_postgres(pool: &PgPool) -> DependencyHealth {
    let start = Instant::now();
    match tokio::time::timeout(PROBE_TIMEOUT, sqlx::query("SELECT 1").fetch_one(pool)).await {
        Ok(Ok(_)) => DependencyHealth::answered("postgres", elapsed_ms(start), POSTGRES_SLOW_MS),
        Ok(Err(e)) => DependencyHealth::unhealthy("postgres", format!("Query failed: {}", e)),
        Err(_) => DependencyHealth::unhealthy("postgres", "Query timed out"),
    }
}

async fn probe_redis(client: &redis::Client) -> DependencyHealth {
    let start = Instant::now();
    let ping = async {
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await
    };
    match tokio::time::timeout(PROBE_TIMEOUT, ping).await {
        Ok(Ok(())) => DependencyHealth::answered("redis", elapsed_ms(start), REDIS_SLOW_MS),
        Ok(Err(e)) => DependencyHealth::unhealthy("redis", format!("PING failed: {}", e)),
        Err(_) => DependencyHealth::unhealthy("redis", "PING timed out"),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
