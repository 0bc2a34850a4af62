pub mod handler;
pub mod key;
pub mod lock;
pub mod response;
pub mod storage;
pub mod sweeper;

pub use handler::{
    IdempotencyMetrics, IdempotencyOutcome, IdempotentRequest, MetricsSnapshot,
    RequestOrchestrator, UncachedReason,
};
pub use key::{validate, CompositeKey, IdempotencyKey, InvalidKey, DEFAULT_MAX_KEY_LENGTH};
pub use lock::{InMemoryLockCoordinator, LockCoordinator, LockGuard, LockToken, RedisLockCoordinator};
pub use response::{fingerprint, CachedResponse, CapturedResponse, WriteOutcome};
pub use storage::{
    ExpiredEntrySweep, InMemoryResponseStore, PostgresResponseStore, RedisResponseStore,
    ResponseStore,
};
pub use sweeper::ExpirationSweeper;
