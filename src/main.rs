use anyhow::Context;
use axum::http::HeaderName;
use idempotency_engine::api::{create_router, AppState};
use idempotency_engine::config::{Settings, StoreBackend};
use idempotency_engine::idempotency::{
    ExpirationSweeper, ExpiredEntrySweep, InMemoryLockCoordinator, InMemoryResponseStore,
    LockCoordinator, PostgresResponseStore, RedisLockCoordinator, RedisResponseStore,
    RequestOrchestrator, ResponseStore,
};
use idempotency_engine::observability::{init_logging, init_metrics, HealthChecker, LogConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

struct Backends {
    store: Arc<dyn ResponseStore>,
    locks: Option<Arc<dyn LockCoordinator>>,
    sweep: Option<Arc<dyn ExpiredEntrySweep>>,
    pool: Option<PgPool>,
    redis_client: Option<redis::Client>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new().context("failed to load configuration")?;

    init_logging(&LogConfig::new(
        settings.application.log_level.clone(),
        &settings.application.log_format,
    ));
    info!("Configuration loaded");

    let metrics_handle = init_metrics().context("failed to install metrics exporter")?;

    let backends = connect_backends(&settings).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper_handle = match (&backends.sweep, settings.sweeper.enabled) {
        (Some(sweep), true) => {
            info!(
                "Starting expiration sweeper (every {}s, batch size {})",
                settings.sweeper.interval_secs, settings.sweeper.batch_size
            );
            Some(ExpirationSweeper::new(Arc::clone(sweep), settings.sweeper.clone()).start(shutdown_rx))
        }
        _ => None,
    };

    let orchestrator = Arc::new(RequestOrchestrator::new(
        backends.store,
        backends.locks,
        settings.idempotency.clone(),
    ));
    info!(
        backend = orchestrator_backend(&settings),
        locking = orchestrator.uses_lock(),
        fail_open = settings.idempotency.fail_open,
        "Idempotency orchestrator ready"
    );

    let health_checker = Arc::new(HealthChecker::new(backends.pool, backends.redis_client));
    let state = AppState::new(orchestrator, health_checker).with_metrics(metrics_handle);
    let request_id = HeaderName::from_static("x-request-id");
    let app = create_router(state)
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid));

    let addr = format!("{}:{}", settings.application.host, settings.application.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutting down");
    shutdown_tx.send(true).ok();
    if let Some(handle) = sweeper_handle {
        if let Err(e) = handle.await {
            tracing::warn!("Sweeper task ended abnormally: {}", e);
        }
    }

    Ok(())
}

fn orchestrator_backend(settings: &Settings) -> &'static str {
    match settings.idempotency.backend {
        StoreBackend::Redis => RedisResponseStore::BACKEND,
        StoreBackend::Postgres => PostgresResponseStore::BACKEND,
        StoreBackend::Memory => InMemoryResponseStore::BACKEND,
    }
}

async fn connect_backends(settings: &Settings) -> anyhow::Result<Backends> {
    let idempotency = &settings.idempotency;

    match idempotency.backend {
        StoreBackend::Memory => {
            info!("Using in-memory idempotency store");
            let store = Arc::new(InMemoryResponseStore::new());
            Ok(Backends {
                store: store.clone(),
                locks: Some(Arc::new(InMemoryLockCoordinator::new())),
                sweep: Some(store),
                pool: None,
                redis_client: None,
            })
        }
        StoreBackend::Redis => {
            let client = connect_redis(&settings.redis.url).await?;
            Ok(Backends {
                store: Arc::new(RedisResponseStore::new(client.clone(), idempotency.key_prefix.clone())),
                locks: Some(Arc::new(RedisLockCoordinator::new(
                    client.clone(),
                    idempotency.key_prefix.clone(),
                ))),
                sweep: None,
                pool: None,
                redis_client: Some(client),
            })
        }
        StoreBackend::Postgres => {
            let pool = connect_postgres(settings).await?;
            let store = Arc::new(PostgresResponseStore::new(pool.clone()));

            // Locks live in Redis; the relational store has no cheap expiring lock.
            let redis_client = if idempotency.use_lock {
                Some(connect_redis(&settings.redis.url).await?)
            } else {
                None
            };
            let locks = redis_client.clone().map(|client| {
                Arc::new(RedisLockCoordinator::new(client, idempotency.key_prefix.clone()))
                    as Arc<dyn LockCoordinator>
            });

            Ok(Backends {
                store: store.clone(),
                locks,
                sweep: Some(store),
                pool: Some(pool),
                redis_client,
            })
        }
    }
}

async fn connect_postgres(settings: &Settings) -> anyhow::Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(settings.database.pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&settings.database.url)
        .await
        .context("failed to connect to database")?;
    info!("Database connection established");

    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to apply migrations")?;
    info!("Migrations applied successfully");

    Ok(pool)
}

async fn connect_redis(url: &str) -> anyhow::Result<redis::Client> {
    info!("Connecting to Redis...");
    let client = redis::Client::open(url).context("invalid redis url")?;
    let mut con = client
        .get_multiplexed_async_connection()
        .await
        .context("failed to connect to redis")?;
    let _: () = redis::cmd("PING")
        .query_async(&mut con)
        .await
        .context("redis PING failed")?;
    info!("Redis connection established");
    Ok(client)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
