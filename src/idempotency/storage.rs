use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, Result, StoreError};
use crate::idempotency::key::CompositeKey;
use crate::idempotency::response::{CachedResponse, WriteOutcome};
use crate::observability::{get_metrics, LatencyTimer};

/// Upper bound on insert/re-read rounds before a write gives up.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Persistence for cached responses, keyed by composite key.
///
/// `try_set` is the authority for first-writer-wins: for concurrent callers
/// on one key, exactly one observes `Written` and the rest observe
/// `AlreadyExists` carrying the winner's response.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResponseStore: Send + Sync {
    /// Returns the live entry for `key`. Expired entries are reported absent
    /// even when still physically stored.
    async fn try_get(&self, key: &CompositeKey) -> Result<Option<CachedResponse>>;

    async fn try_set(&self, key: &CompositeKey, response: &CachedResponse) -> Result<WriteOutcome>;

    fn backend_name(&self) -> &'static str;
}

/// Backends whose expired entries must be deleted explicitly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExpiredEntrySweep: Send + Sync {
    /// Deletes at most `limit` entries that expired at or before `now`.
    async fn delete_expired_batch(&self, now: DateTime<Utc>, limit: i64) -> Result<u64>;
}

fn observe<T>(backend: &str, operation: &str, timer: &LatencyTimer, result: &Result<T>) {
    get_metrics().record_store_operation(backend, operation, timer.elapsed_ms(), result.is_ok());
}

// ============================================================================
// PostgreSQL
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ResponseRow {
    id: Uuid,
    status_code: i32,
    body: Option<String>,
    content_type: Option<String>,
    request_fingerprint: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl ResponseRow {
    fn into_parts(self) -> Result<(Uuid, CachedResponse)> {
        let status_code = u16::try_from(self.status_code).map_err(|_| {
            StoreError::Backend(format!("stored status code {} is out of range", self.status_code))
        })?;

        Ok((
            self.id,
            CachedResponse {
                status_code,
                body: self.body,
                content_type: self.content_type,
                created_at: self.created_at,
                expires_at: self.expires_at,
                request_fingerprint: self.request_fingerprint,
            },
        ))
    }
}

/// Relational backend. The unique index over `(route, method, idempotency_key)`
/// is the conflict signal; logical expiry is checked on read and rows are
/// physically removed by the sweeper.
#[derive(Clone)]
pub struct PostgresResponseStore {
    pool: PgPool,
}

impl PostgresResponseStore {
    pub const BACKEND: &'static str = "postgres";

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_row(&self, key: &CompositeKey) -> Result<Option<ResponseRow>> {
        let row = sqlx::query_as::<_, ResponseRow>(
            r#"
            SELECT id, status_code, body, content_type, request_fingerprint, created_at, expires_at
            FROM idempotency_responses
            WHERE route = $1 AND method = $2 AND idempotency_key = $3
            "#,
        )
        .bind(key.route())
        .bind(key.method())
        .bind(key.key().as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(row)
    }

    async fn insert(&self, key: &CompositeKey, response: &CachedResponse) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_responses (id, route, method, idempotency_key, status_code, body, content_type, request_fingerprint, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.route())
        .bind(key.method())
        .bind(key.key().as_str())
        .bind(i32::from(response.status_code))
        .bind(&response.body)
        .bind(&response.content_type)
        .bind(&response.request_fingerprint)
        .bind(response.created_at)
        .bind(response.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Removes one expired row that blocks a new insert. Conditional on the
    /// row still being expired, so a concurrent fresh write is never deleted.
    async fn delete_stale(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_responses
            WHERE id = $1 AND expires_at <= $2
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn lookup(&self, key: &CompositeKey) -> Result<Option<CachedResponse>> {
        let Some(row) = self.find_row(key).await? else {
            return Ok(None);
        };
        let (_, response) = row.into_parts()?;

        if response.is_live_at(Utc::now()) {
            Ok(Some(response))
        } else {
            Ok(None)
        }
    }

    async fn write(&self, key: &CompositeKey, response: &CachedResponse) -> Result<WriteOutcome> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            match self.insert(key, response).await {
                Ok(()) => return Ok(WriteOutcome::Written),
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    tracing::debug!(key = %key, attempt, "Unique constraint hit, reading existing response");
                }
                Err(e) => return Err(StoreError::Database(e).into()),
            }

            let now = Utc::now();
            if let Some(row) = self.find_row(key).await? {
                let (id, existing) = row.into_parts()?;
                if existing.is_live_at(now) {
                    return Ok(WriteOutcome::AlreadyExists(existing));
                }
                if self.delete_stale(id, now).await? {
                    tracing::debug!(key = %key, "Removed expired row ahead of sweep");
                }
            }
        }

        Err(StoreError::Backend(format!(
            "write for {} did not settle after {} attempts",
            key, MAX_WRITE_ATTEMPTS
        ))
        .into())
    }
}

#[async_trait]
impl ResponseStore for PostgresResponseStore {
    async fn try_get(&self, key: &CompositeKey) -> Result<Option<CachedResponse>> {
        let timer = LatencyTimer::new();
        let result = self.lookup(key).await;
        observe(Self::BACKEND, "try_get", &timer, &result);
        result
    }

    async fn try_set(&self, key: &CompositeKey, response: &CachedResponse) -> Result<WriteOutcome> {
        let timer = LatencyTimer::new();
        let result = self.write(key, response).await;
        observe(Self::BACKEND, "try_set", &timer, &result);
        result
    }

    fn backend_name(&self) -> &'static str {
        Self::BACKEND
    }
}

#[async_trait]
impl ExpiredEntrySweep for PostgresResponseStore {
    async fn delete_expired_batch(&self, now: DateTime<Utc>, limit: i64) -> Result<u64> {
        let timer = LatencyTimer::new();
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_responses
            WHERE id IN (
                SELECT id FROM idempotency_responses
                WHERE expires_at <= $1
                ORDER BY expires_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(now)
        .bind(limit)
        .execute(&self.pool)
        .await
        .map(|r| r.rows_affected())
        .map_err(|e| AppError::from(StoreError::Database(e)));

        observe(Self::BACKEND, "sweep", &timer, &result);
        result
    }
}

// ============================================================================
// Redis
// ============================================================================

/// Atomic-cache backend built on `SET NX PX`. Entries expire natively.
#[derive(Clone)]
pub struct RedisResponseStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisResponseStore {
    pub const BACKEND: &'static str = "redis";

    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn make_key(&self, key: &CompositeKey) -> String {
        format!("{}:response:{}", self.key_prefix, key.storage_key())
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        Ok(self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StoreError::Redis)?)
    }

    /// Reads and decodes one entry. An undecodable entry is deleted and
    /// reported absent.
    async fn read(&self, conn: &mut MultiplexedConnection, redis_key: &str) -> Result<Option<CachedResponse>> {
        let raw: Option<String> = conn.get(redis_key).await.map_err(StoreError::Redis)?;
        let Some(json) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<CachedResponse>(&json) {
            Ok(response) => Ok(Some(response)),
            Err(e) => {
                tracing::warn!(key = %redis_key, "Discarding undecodable cached response: {}", e);
                let _: i64 = conn.del(redis_key).await.map_err(StoreError::Redis)?;
                Ok(None)
            }
        }
    }

    async fn lookup(&self, key: &CompositeKey) -> Result<Option<CachedResponse>> {
        let mut conn = self.connection().await?;
        let response = self.read(&mut conn, &self.make_key(key)).await?;
        Ok(response.filter(|r| r.is_live_at(Utc::now())))
    }

    async fn write(&self, key: &CompositeKey, response: &CachedResponse) -> Result<WriteOutcome> {
        let ttl_ms = response.remaining_ttl(Utc::now()).num_milliseconds();
        if ttl_ms <= 0 {
            return Err(AppError::Validation(
                "Cannot cache a response that has already expired".to_string(),
            ));
        }

        let payload = serde_json::to_string(response)
            .map_err(|e| AppError::Serialization(format!("Failed to encode cached response: {}", e)))?;
        let redis_key = self.make_key(key);
        let mut conn = self.connection().await?;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let written: Option<String> = conn
                .set_options(
                    &redis_key,
                    &payload,
                    redis::SetOptions::default()
                        .conditional_set(redis::ExistenceCheck::NX)
                        .with_expiration(redis::SetExpiry::PX(ttl_ms as usize)),
                )
                .await
                .map_err(StoreError::Redis)?;

            if written.is_some() {
                return Ok(WriteOutcome::Written);
            }

            // Lost the conditional write; the winner may have expired or been
            // discarded between the SET and this GET, in which case retry.
            if let Some(existing) = self.read(&mut conn, &redis_key).await? {
                return Ok(WriteOutcome::AlreadyExists(existing));
            }
            tracing::debug!(key = %key, attempt, "Existing entry vanished before re-read, retrying");
        }

        Err(StoreError::Backend(format!(
            "write for {} did not settle after {} attempts",
            key, MAX_WRITE_ATTEMPTS
        ))
        .into())
    }
}

#[async_trait]
impl ResponseStore for RedisResponseStore {
    async fn try_get(&self, key: &CompositeKey) -> Result<Option<CachedResponse>> {
        let timer = LatencyTimer::new();
        let result = self.lookup(key).await;
        observe(Self::BACKEND, "try_get", &timer, &result);
        result
    }

    async fn try_set(&self, key: &CompositeKey, response: &CachedResponse) -> Result<WriteOutcome> {
        let timer = LatencyTimer::new();
        let result = self.write(key, response).await;
        observe(Self::BACKEND, "try_set", &timer, &result);
        result
    }

    fn backend_name(&self) -> &'static str {
        Self::BACKEND
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Single-process backend for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryResponseStore {
    entries: Mutex<HashMap<CompositeKey, CachedResponse>>,
}

impl InMemoryResponseStore {
    pub const BACKEND: &'static str = "memory";

    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physically stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl ResponseStore for InMemoryResponseStore {
    async fn try_get(&self, key: &CompositeKey) -> Result<Option<CachedResponse>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|r| r.is_live_at(Utc::now()))
            .cloned())
    }

    async fn try_set(&self, key: &CompositeKey, response: &CachedResponse) -> Result<WriteOutcome> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(key) {
            if existing.is_live_at(Utc::now()) {
                return Ok(WriteOutcome::AlreadyExists(existing.clone()));
            }
        }
        entries.insert(key.clone(), response.clone());
        Ok(WriteOutcome::Written)
    }

    fn backend_name(&self) -> &'static str {
        Self::BACKEND
    }
}

#[async_trait]
impl ExpiredEntrySweep for InMemoryResponseStore {
    async fn delete_expired_batch(&self, now: DateTime<Utc>, limit: i64) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        let expired: Vec<CompositeKey> = entries
            .iter()
            .filter(|(_, r)| !r.is_live_at(now))
            .map(|(k, _)| k.clone())
            .take(limit)
            .collect();

        for key in &expired {
            entries.remove(key);
        }
        Ok(expired.len() as u64)
    }
}
