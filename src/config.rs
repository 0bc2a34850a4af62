use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

use crate::error::{AppError, Result};
use crate::idempotency::key::DEFAULT_MAX_KEY_LENGTH;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub application: ApplicationSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    pub sweeper: SweeperSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// What to do when another request holds the lock for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Answer immediately with a conflict.
    ReturnConflict,
    /// Poll the response store a bounded number of times, then conflict.
    WaitAndPoll,
}

/// Handling of a replay whose stored request fingerprint differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintPolicy {
    Ignore,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Redis,
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct IdempotencySettings {
    #[validate(length(min = 1))]
    pub header_name: String,
    #[validate(range(min = 1, max = 4096))]
    pub max_key_length: usize,
    #[validate(range(min = 1, max = 31536000))]
    pub expiration_secs: u64,
    /// Also cache 4xx responses. 5xx are never cached.
    pub cache_error_responses: bool,
    pub conflict_policy: ConflictPolicy,
    #[validate(range(min = 1, max = 100))]
    pub poll_attempts: u32,
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,
    #[validate(range(min = 1))]
    pub lock_timeout_secs: u64,
    pub use_lock: bool,
    pub fail_open: bool,
    pub require_key: bool,
    pub fingerprint_policy: FingerprintPolicy,
    pub backend: StoreBackend,
    #[validate(length(min = 1))]
    pub key_prefix: String,
    #[validate(range(min = 1))]
    pub max_body_bytes: usize,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            header_name: "Idempotency-Key".to_string(),
            max_key_length: DEFAULT_MAX_KEY_LENGTH,
            expiration_secs: 86400, // 24 hours
            cache_error_responses: false,
            conflict_policy: ConflictPolicy::ReturnConflict,
            poll_attempts: 5,
            poll_interval_ms: 200,
            lock_timeout_secs: 30,
            use_lock: true,
            fail_open: false,
            require_key: true,
            fingerprint_policy: FingerprintPolicy::Ignore,
            backend: StoreBackend::Redis,
            key_prefix: "idem".to_string(),
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl IdempotencySettings {
    pub fn expiration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiration_secs as i64)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// 2xx and 3xx always; 4xx only when enabled; never 1xx or 5xx.
    pub fn is_cacheable_status(&self, status_code: u16) -> bool {
        match status_code {
            200..=399 => true,
            400..=499 => self.cache_error_responses,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct SweeperSettings {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub interval_secs: u64,
    #[validate(range(min = 1, max = 100000))]
    pub batch_size: i64,
    #[validate(range(min = 1))]
    pub max_batches_per_sweep: u32,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            batch_size: 1000,
            max_batches_per_sweep: 10,
        }
    }
}

impl SweeperSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Settings {
    pub fn new() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.idempotency
            .validate()
            .map_err(|e| AppError::Validation(format!("idempotency settings: {}", e)))?;
        self.sweeper
            .validate()
            .map_err(|e| AppError::Validation(format!("sweeper settings: {}", e)))?;
        Ok(())
    }
}
