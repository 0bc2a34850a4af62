use thiserror::Error;

use crate::idempotency::key::InvalidKey;

/// Failure talking to an idempotency backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid idempotency key: {0}")]
    InvalidKey(#[from] InvalidKey),

    #[error("Idempotency store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("Serialization failure: {0}")]
    Serialization(String),

    #[error("Downstream operation failed: {0}")]
    Downstream(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// True when the error originates from an unreachable or failing backend.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, AppError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_lifts_into_store_unavailable() {
        let err: AppError = StoreError::Backend("connection refused".to_string()).into();
        assert!(err.is_store_unavailable());
        assert_eq!(
            err.to_string(),
            "Idempotency store unavailable: connection refused"
        );
    }

    #[test]
    fn test_invalid_key_is_not_store_failure() {
        let err: AppError = InvalidKey::Empty.into();
        assert!(!err.is_store_unavailable());
    }
}
