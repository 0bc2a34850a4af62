use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};

/// Response produced by the protected operation, before any caching decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResponse {
    pub status_code: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl CapturedResponse {
    pub fn new(status_code: u16, content_type: Option<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            content_type,
            body: body.into(),
        }
    }

    pub fn json(status_code: u16, value: &serde_json::Value) -> Self {
        Self::new(
            status_code,
            Some("application/json".to_string()),
            value.to_string(),
        )
    }
}

/// Stored replay of an executed request. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status_code: u16,
    pub body: Option<String>,
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub request_fingerprint: Option<String>,
}

impl CachedResponse {
    /// Builds a cacheable snapshot of `captured` that lives for `ttl`.
    ///
    /// Fails with `AppError::Serialization` when the body is not valid UTF-8,
    /// and with `AppError::Validation` for a non-positive `ttl`.
    pub fn from_captured(
        captured: &CapturedResponse,
        ttl: Duration,
        request_fingerprint: Option<String>,
    ) -> Result<Self> {
        if ttl <= Duration::zero() {
            return Err(AppError::Validation(
                "Cached response TTL must be positive".to_string(),
            ));
        }

        let body = if captured.body.is_empty() {
            None
        } else {
            let text = String::from_utf8(captured.body.clone()).map_err(|e| {
                AppError::Serialization(format!("response body is not valid UTF-8: {}", e))
            })?;
            Some(text)
        };

        let created_at = Utc::now();
        Ok(Self {
            status_code: captured.status_code,
            body,
            content_type: captured.content_type.clone(),
            created_at,
            expires_at: created_at + ttl,
            request_fingerprint,
        })
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        !self.is_live_at(Utc::now())
    }

    /// Time left before the entry expires, zero if already expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        let remaining = self.expires_at - now;
        if remaining < Duration::zero() {
            Duration::zero()
        } else {
            remaining
        }
    }

    pub fn to_captured(&self) -> CapturedResponse {
        CapturedResponse {
            status_code: self.status_code,
            content_type: self.content_type.clone(),
            body: self
                .body
                .as_ref()
                .map(|b| b.as_bytes().to_vec())
                .unwrap_or_default(),
        }
    }
}

/// Result of a conditional write. The only first-writer-wins signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    AlreadyExists(CachedResponse),
}

/// SHA-256 hex digest of a request body.
pub fn fingerprint(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_captured_keeps_status_body_and_content_type() {
        let captured = CapturedResponse::json(201, &serde_json::json!({"orderId": "X"}));
        let cached = CachedResponse::from_captured(&captured, Duration::hours(24), None).unwrap();

        assert_eq!(cached.status_code, 201);
        assert_eq!(cached.body.as_deref(), Some(r#"{"orderId":"X"}"#));
        assert_eq!(cached.content_type.as_deref(), Some("application/json"));
        assert!(cached.expires_at > cached.created_at);
        assert_eq!(cached.to_captured(), captured);
    }

    #[test]
    fn test_empty_body_is_stored_as_none() {
        let captured = CapturedResponse::new(204, None, Vec::new());
        let cached = CachedResponse::from_captured(&captured, Duration::seconds(60), None).unwrap();

        assert!(cached.body.is_none());
        assert!(cached.to_captured().body.is_empty());
    }

    #[test]
    fn test_non_utf8_body_is_a_serialization_failure() {
        let captured = CapturedResponse::new(200, None, vec![0xff, 0xfe, 0x00]);
        let err = CachedResponse::from_captured(&captured, Duration::seconds(60), None).unwrap_err();
        assert!(matches!(err, AppError::Serialization(_)));
    }

    #[test]
    fn test_non_positive_ttl_is_rejected() {
        let captured = CapturedResponse::new(200, None, "ok");
        assert!(CachedResponse::from_captured(&captured, Duration::zero(), None).is_err());
    }

    #[test]
    fn test_liveness() {
        let captured = CapturedResponse::new(200, None, "ok");
        let cached = CachedResponse::from_captured(&captured, Duration::seconds(10), None).unwrap();

        assert!(cached.is_live_at(cached.created_at));
        assert!(!cached.is_live_at(cached.expires_at));
        assert!(!cached.is_expired());
        assert_eq!(cached.remaining_ttl(cached.expires_at + Duration::seconds(5)), Duration::zero());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint(b"{\"a\":1}"), fingerprint(b"{\"a\":1}"));
        assert_ne!(fingerprint(b"{\"a\":1}"), fingerprint(b"{\"a\":2}"));
        assert_eq!(fingerprint(b"").len(), 64);
    }
}
