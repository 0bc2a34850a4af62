use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::config::{ConflictPolicy, FingerprintPolicy, IdempotencySettings};
use crate::error::{AppError, Result};
use crate::idempotency::key::{CompositeKey, IdempotencyKey, InvalidKey};
use crate::idempotency::lock::{LockCoordinator, LockGuard};
use crate::idempotency::response::{CachedResponse, CapturedResponse, WriteOutcome};
use crate::idempotency::storage::ResponseStore;
use crate::observability::{get_metrics, mask_key};

/// Counters for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub executed_requests: AtomicU64,
    pub cached_responses: AtomicU64,
    pub lost_races: AtomicU64,
    pub conflicts: AtomicU64,
    pub rejected_keys: AtomicU64,
    pub store_failures: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self) {
        self.replayed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution(&self) {
        self.executed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cached(&self) {
        self.cached_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost_race(&self) {
        self.lost_races.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_key(&self) {
        self.rejected_keys.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            executed_requests: self.executed_requests.load(Ordering::Relaxed),
            cached_responses: self.cached_responses.load(Ordering::Relaxed),
            lost_races: self.lost_races.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            rejected_keys: self.rejected_keys.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub replayed_requests: u64,
    pub executed_requests: u64,
    pub cached_responses: u64,
    pub lost_races: u64,
    pub conflicts: u64,
    pub rejected_keys: u64,
    pub store_failures: u64,
}

impl MetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / self.total_requests as f64
        }
    }
}

/// The identity of an incoming request, as seen by the orchestrator.
#[derive(Debug, Clone)]
pub struct IdempotentRequest {
    pub method: String,
    pub route_template: String,
    pub raw_key: Option<String>,
    pub fingerprint: Option<String>,
}

impl IdempotentRequest {
    pub fn new(method: impl Into<String>, route_template: impl Into<String>, raw_key: Option<String>) -> Self {
        Self {
            method: method.into(),
            route_template: route_template.into(),
            raw_key,
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

/// Why an executed response was returned without being cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncachedReason {
    /// Status code outside the caching policy.
    NotEligible,
    /// The store failed on lookup (fail-open) or on write.
    StoreUnavailable,
    /// The body could not be turned into a cacheable form.
    SerializationFailure,
}

/// Terminal state of one orchestrated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    RejectedInvalidKey(InvalidKey),
    ReplayedFromCache(CachedResponse),
    ExecutedAndCached {
        response: CapturedResponse,
        expires_at: DateTime<Utc>,
    },
    ExecutedUncached {
        response: CapturedResponse,
        reason: UncachedReason,
    },
    Conflict {
        retry_after: Duration,
    },
    FingerprintMismatch,
}

impl IdempotencyOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IdempotencyOutcome::RejectedInvalidKey(_) => "rejected_invalid_key",
            IdempotencyOutcome::ReplayedFromCache(_) => "replayed",
            IdempotencyOutcome::ExecutedAndCached { .. } => "executed_cached",
            IdempotencyOutcome::ExecutedUncached { .. } => "executed_uncached",
            IdempotencyOutcome::Conflict { .. } => "conflict",
            IdempotencyOutcome::FingerprintMismatch => "fingerprint_mismatch",
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, IdempotencyOutcome::ReplayedFromCache(_))
    }

    /// Whether this request ran the protected operation.
    pub fn executed(&self) -> bool {
        matches!(
            self,
            IdempotencyOutcome::ExecutedAndCached { .. } | IdempotencyOutcome::ExecutedUncached { .. }
        )
    }
}

enum LockAttempt {
    Acquired(LockGuard),
    Contended,
    Skipped,
}

/// Sequences key validation, locking, lookup, execution and caching around
/// one protected operation.
pub struct RequestOrchestrator {
    store: Arc<dyn ResponseStore>,
    locks: Option<Arc<dyn LockCoordinator>>,
    metrics: Arc<IdempotencyMetrics>,
    config: IdempotencySettings,
}

impl RequestOrchestrator {
    pub fn new(
        store: Arc<dyn ResponseStore>,
        locks: Option<Arc<dyn LockCoordinator>>,
        config: IdempotencySettings,
    ) -> Self {
        let locks = if config.use_lock { locks } else { None };
        Self {
            store,
            locks,
            metrics: Arc::new(IdempotencyMetrics::new()),
            config,
        }
    }

    /// Gets the metrics for this orchestrator.
    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &IdempotencySettings {
        &self.config
    }

    pub fn uses_lock(&self) -> bool {
        self.locks.is_some()
    }

    /// Runs `operation` at most once per composite key.
    ///
    /// Errors from `operation` are returned unchanged and nothing is cached.
    /// `AppError::StoreUnavailable` is returned only when the lookup path
    /// fails under fail-closed configuration.
    pub async fn execute<F, Fut>(&self, request: IdempotentRequest, operation: F) -> Result<IdempotencyOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CapturedResponse>>,
    {
        self.metrics.record_request();

        let key = match request.raw_key.as_deref() {
            None => Err(InvalidKey::Missing),
            Some(raw) => IdempotencyKey::parse(raw, self.config.max_key_length),
        };
        let key = match key {
            Ok(key) => key,
            Err(reason) => {
                self.metrics.record_rejected_key();
                tracing::debug!(method = %request.method, route = %request.route_template, "Rejected idempotency key: {}", reason);
                return Ok(self.finish(IdempotencyOutcome::RejectedInvalidKey(reason)));
            }
        };

        let composite = CompositeKey::build(&request.method, &request.route_template, &key);
        let span = tracing::info_span!(
            "idempotency",
            method = %composite.method(),
            route = %composite.route(),
            key = %mask_key(key.as_str()),
        );

        let outcome = self
            .run(&composite, request.fingerprint, operation)
            .instrument(span)
            .await?;
        Ok(self.finish(outcome))
    }

    async fn run<F, Fut>(
        &self,
        composite: &CompositeKey,
        fingerprint: Option<String>,
        operation: F,
    ) -> Result<IdempotencyOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CapturedResponse>>,
    {
        let mut store_reachable = true;

        match self.store.try_get(composite).await {
            Ok(Some(cached)) => return Ok(self.replay(cached, fingerprint.as_deref())),
            Ok(None) => {}
            Err(e) => {
                self.on_lookup_failure(e)?;
                store_reachable = false;
            }
        }

        let guard = if store_reachable {
            match self.acquire_lock(composite).await {
                LockAttempt::Acquired(guard) => Some(guard),
                LockAttempt::Skipped => None,
                LockAttempt::Contended => {
                    return self.resolve_contention(composite, fingerprint.as_deref()).await;
                }
            }
        } else {
            None
        };

        // Another holder may have written between the first lookup and the lock.
        if guard.is_some() {
            match self.store.try_get(composite).await {
                Ok(Some(cached)) => {
                    release(guard).await;
                    return Ok(self.replay(cached, fingerprint.as_deref()));
                }
                Ok(None) => {}
                Err(e) => {
                    if let Err(e) = self.on_lookup_failure(e) {
                        release(guard).await;
                        return Err(e);
                    }
                    store_reachable = false;
                }
            }
        }

        self.metrics.record_execution();
        let captured = match operation().await {
            Ok(captured) => captured,
            Err(e) => {
                release(guard).await;
                return Err(e);
            }
        };

        let outcome = if store_reachable {
            self.cache_result(composite, captured, fingerprint).await
        } else {
            IdempotencyOutcome::ExecutedUncached {
                response: captured,
                reason: UncachedReason::StoreUnavailable,
            }
        };

        release(guard).await;
        Ok(outcome)
    }

    /// Fail-closed propagates the error; fail-open logs and lets the request
    /// proceed without caching.
    fn on_lookup_failure(&self, error: AppError) -> Result<()> {
        self.metrics.record_store_failure();
        if self.config.fail_open {
            tracing::warn!(backend = self.store.backend_name(), "Idempotency lookup failed, proceeding uncached: {}", error);
            Ok(())
        } else {
            tracing::error!(backend = self.store.backend_name(), "Idempotency lookup failed, rejecting request: {}", error);
            Err(error)
        }
    }

    async fn acquire_lock(&self, composite: &CompositeKey) -> LockAttempt {
        let Some(locks) = &self.locks else {
            return LockAttempt::Skipped;
        };

        match locks.try_acquire(composite, self.config.lock_timeout()).await {
            Ok(Some(token)) => {
                get_metrics().record_lock_acquisition(true);
                LockAttempt::Acquired(LockGuard::new(Arc::clone(locks), token))
            }
            Ok(None) => {
                get_metrics().record_lock_acquisition(false);
                LockAttempt::Contended
            }
            Err(e) => {
                let error = AppError::LockUnavailable(e.to_string());
                tracing::warn!("Proceeding without lock: {}", error);
                LockAttempt::Skipped
            }
        }
    }

    async fn resolve_contention(
        &self,
        composite: &CompositeKey,
        fingerprint: Option<&str>,
    ) -> Result<IdempotencyOutcome> {
        if self.config.conflict_policy == ConflictPolicy::WaitAndPoll {
            for attempt in 1..=self.config.poll_attempts {
                tokio::time::sleep(self.config.poll_interval()).await;
                match self.store.try_get(composite).await {
                    Ok(Some(cached)) => {
                        tracing::debug!(attempt, "In-flight request finished while polling");
                        return Ok(self.replay(cached, fingerprint));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.on_lookup_failure(e)?;
                        break;
                    }
                }
            }
        }

        self.metrics.record_conflict();
        Ok(IdempotencyOutcome::Conflict {
            retry_after: self.config.lock_timeout(),
        })
    }

    async fn cache_result(
        &self,
        composite: &CompositeKey,
        captured: CapturedResponse,
        fingerprint: Option<String>,
    ) -> IdempotencyOutcome {
        if !self.config.is_cacheable_status(captured.status_code) {
            return IdempotencyOutcome::ExecutedUncached {
                response: captured,
                reason: UncachedReason::NotEligible,
            };
        }

        let cached = match CachedResponse::from_captured(&captured, self.config.expiration(), fingerprint.clone()) {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!("Response not cached: {}", e);
                return IdempotencyOutcome::ExecutedUncached {
                    response: captured,
                    reason: UncachedReason::SerializationFailure,
                };
            }
        };

        match self.store.try_set(composite, &cached).await {
            Ok(WriteOutcome::Written) => {
                self.metrics.record_cached();
                IdempotencyOutcome::ExecutedAndCached {
                    response: captured,
                    expires_at: cached.expires_at,
                }
            }
            Ok(WriteOutcome::AlreadyExists(existing)) => {
                self.metrics.record_lost_race();
                tracing::debug!("Lost the write race, replaying the stored response");
                self.replay(existing, fingerprint.as_deref())
            }
            Err(e) => {
                self.metrics.record_store_failure();
                tracing::error!(backend = self.store.backend_name(), "Failed to cache response: {}", e);
                IdempotencyOutcome::ExecutedUncached {
                    response: captured,
                    reason: UncachedReason::StoreUnavailable,
                }
            }
        }
    }

    fn replay(&self, cached: CachedResponse, fingerprint: Option<&str>) -> IdempotencyOutcome {
        if self.config.fingerprint_policy == FingerprintPolicy::Reject {
            if let (Some(stored), Some(incoming)) = (cached.request_fingerprint.as_deref(), fingerprint) {
                if stored != incoming {
                    tracing::warn!("Idempotency key reused with a different request body");
                    return IdempotencyOutcome::FingerprintMismatch;
                }
            }
        }
        IdempotencyOutcome::ReplayedFromCache(cached)
    }

    fn finish(&self, outcome: IdempotencyOutcome) -> IdempotencyOutcome {
        if outcome.is_replay() {
            self.metrics.record_replay();
        }
        get_metrics().record_idempotency_outcome(outcome.label());
        outcome
    }
}

async fn release(guard: Option<LockGuard>) {
    if let Some(guard) = guard {
        guard.release().await;
    }
}
