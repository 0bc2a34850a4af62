use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::idempotency::key::CompositeKey;

/// Deletes the lock only if it still belongs to the caller.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Proof of holding the advisory lock for one composite key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: CompositeKey,
    pub holder: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl LockToken {
    pub fn new(key: CompositeKey, ttl: Duration) -> Self {
        Self {
            key,
            holder: Uuid::new_v4(),
            acquired_at: Utc::now(),
            ttl,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + chrono::Duration::milliseconds(self.ttl.as_millis() as i64)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Short-lived per-key mutual exclusion that reduces duplicate execution.
///
/// Advisory only: losing a token (expiry, crash) never breaks correctness,
/// because the response store's conditional write decides the winner.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Returns a token when the lock was free, `None` when another holder has it.
    async fn try_acquire(&self, key: &CompositeKey, ttl: Duration) -> Result<Option<LockToken>>;

    /// Releases the lock if `token` still owns it. Returns whether it did.
    async fn release(&self, token: &LockToken) -> Result<bool>;
}

/// Redis lock using `SET NX PX` and an owner-checked delete.
pub struct RedisLockCoordinator {
    client: redis::Client,
    key_prefix: String,
    release_script: redis::Script,
}

impl RedisLockCoordinator {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            release_script: redis::Script::new(RELEASE_SCRIPT),
        }
    }

    fn make_key(&self, key: &CompositeKey) -> String {
        format!("{}:lock:{}", self.key_prefix, key.storage_key())
    }
}

#[async_trait]
impl LockCoordinator for RedisLockCoordinator {
    async fn try_acquire(&self, key: &CompositeKey, ttl: Duration) -> Result<Option<LockToken>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StoreError::Redis)?;

        let token = LockToken::new(key.clone(), ttl);
        let ttl_ms = ttl.as_millis().max(1) as usize;
        let acquired: Option<String> = conn
            .set_options(
                self.make_key(key),
                token.holder.to_string(),
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::PX(ttl_ms)),
            )
            .await
            .map_err(StoreError::Redis)?;

        Ok(acquired.map(|_| token))
    }

    async fn release(&self, token: &LockToken) -> Result<bool> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StoreError::Redis)?;

        let deleted: i64 = self
            .release_script
            .key(self.make_key(&token.key))
            .arg(token.holder.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::Redis)?;

        Ok(deleted > 0)
    }
}

/// Single-process lock for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryLockCoordinator {
    held: Mutex<HashMap<CompositeKey, LockToken>>,
}

impl InMemoryLockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_held(&self, key: &CompositeKey) -> bool {
        self.held
            .lock()
            .await
            .get(key)
            .map(|t| !t.is_expired_at(Utc::now()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockCoordinator for InMemoryLockCoordinator {
    async fn try_acquire(&self, key: &CompositeKey, ttl: Duration) -> Result<Option<LockToken>> {
        let mut held = self.held.lock().await;
        if let Some(current) = held.get(key) {
            if !current.is_expired_at(Utc::now()) {
                return Ok(None);
            }
        }

        let token = LockToken::new(key.clone(), ttl);
        held.insert(key.clone(), token.clone());
        Ok(Some(token))
    }

    async fn release(&self, token: &LockToken) -> Result<bool> {
        let mut held = self.held.lock().await;
        match held.get(&token.key) {
            Some(current) if current.holder == token.holder => {
                held.remove(&token.key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Scoped lock ownership.
///
/// `release` is the normal path. If the guard is dropped while still holding
/// the token (the owning future was cancelled or panicked), release is
/// spawned onto the current runtime so the lock does not linger until TTL.
pub struct LockGuard {
    coordinator: Arc<dyn LockCoordinator>,
    token: Option<LockToken>,
}

impl LockGuard {
    pub fn new(coordinator: Arc<dyn LockCoordinator>, token: LockToken) -> Self {
        Self {
            coordinator,
            token: Some(token),
        }
    }

    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    pub async fn release(mut self) {
        if let Some(token) = self.token.take() {
            release_token(self.coordinator.as_ref(), &token).await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let coordinator = Arc::clone(&self.coordinator);
                handle.spawn(async move {
                    release_token(coordinator.as_ref(), &token).await;
                });
            }
            Err(_) => {
                tracing::warn!(key = %token.key, "No runtime to release lock; it will expire by TTL");
            }
        }
    }
}

async fn release_token(coordinator: &dyn LockCoordinator, token: &LockToken) {
    match coordinator.release(token).await {
        Ok(true) => tracing::debug!(key = %token.key, "Released idempotency lock"),
        Ok(false) => tracing::debug!(key = %token.key, "Idempotency lock already expired or taken over"),
        Err(e) => tracing::warn!(key = %token.key, "Failed to release idempotency lock: {}", e),
    }
}
