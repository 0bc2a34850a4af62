use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default upper bound on the length of a caller-supplied key.
pub const DEFAULT_MAX_KEY_LENGTH: usize = 256;

/// Reason a raw header value was refused as an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidKey {
    #[error("idempotency key is missing")]
    Missing,

    #[error("idempotency key is empty")]
    Empty,

    #[error("idempotency key is {length} characters long, maximum is {max}")]
    TooLong { length: usize, max: usize },

    #[error("idempotency key contains invalid character {character:?} at position {position}")]
    InvalidCharacter { character: char, position: usize },
}

/// A caller-supplied key that passed validation.
///
/// Only `[A-Za-z0-9_-]` characters, never empty, never longer than the
/// configured maximum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn parse(raw: &str, max_length: usize) -> Result<Self, InvalidKey> {
        validate(raw, max_length)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validates a raw header value exactly as given; whitespace is never stripped.
pub fn validate(raw: &str, max_length: usize) -> Result<IdempotencyKey, InvalidKey> {
    if raw.trim().is_empty() {
        return Err(InvalidKey::Empty);
    }

    let length = raw.chars().count();
    if length > max_length {
        return Err(InvalidKey::TooLong {
            length,
            max: max_length,
        });
    }

    if let Some((position, character)) = raw
        .chars()
        .enumerate()
        .find(|(_, c)| !is_key_char(*c))
    {
        return Err(InvalidKey::InvalidCharacter {
            character,
            position,
        });
    }

    Ok(IdempotencyKey(raw.to_string()))
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Storage identity of a request: (method, route template, key).
///
/// The method is upper-cased and the route template lower-cased, so header
/// or framework casing differences never split one logical request across
/// two entries. The key itself stays case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeKey {
    method: String,
    route: String,
    key: IdempotencyKey,
}

impl CompositeKey {
    pub fn build(method: &str, route_template: &str, key: &IdempotencyKey) -> Self {
        Self {
            method: method.trim().to_ascii_uppercase(),
            route: normalize_route(route_template),
            key: key.clone(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Flat string form used by key/value backends.
    ///
    /// Neither the method nor the key may contain `:`, so the route in the
    /// middle is recoverable even when the template itself contains one.
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.method, self.route, self.key)
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.method, self.route, self.key)
    }
}

fn normalize_route(route_template: &str) -> String {
    let trimmed = route_template.trim().trim_end_matches('/');
    let lowered = trimmed.to_lowercase();
    if lowered.starts_with('/') {
        lowered
    } else {
        format!("/{}", lowered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> IdempotencyKey {
        validate(raw, DEFAULT_MAX_KEY_LENGTH).unwrap()
    }

    #[test]
    fn test_accepts_alphanumeric_hyphen_underscore() {
        let parsed = key("abc-123_XYZ");
        assert_eq!(parsed.as_str(), "abc-123_XYZ");
    }

    #[test]
    fn test_rejects_surrounding_whitespace() {
        assert_eq!(
            validate("abc-123 ", DEFAULT_MAX_KEY_LENGTH),
            Err(InvalidKey::InvalidCharacter {
                character: ' ',
                position: 7
            })
        );
        assert_eq!(
            validate(" abc", 4),
            Err(InvalidKey::InvalidCharacter {
                character: ' ',
                position: 0
            })
        );
        assert!(matches!(
            validate("abc\t", 64),
            Err(InvalidKey::InvalidCharacter { character: '\t', .. })
        ));
    }

    #[test]
    fn test_length_counts_trailing_whitespace() {
        let padded = format!("{} ", "a".repeat(256));
        assert_eq!(
            validate(&padded, 256),
            Err(InvalidKey::TooLong {
                length: 257,
                max: 256
            })
        );
    }

    #[test]
    fn test_rejects_empty_and_whitespace() {
        assert_eq!(validate("", 10), Err(InvalidKey::Empty));
        assert_eq!(validate("   ", 10), Err(InvalidKey::Empty));
    }

    #[test]
    fn test_length_boundary() {
        let exact = "a".repeat(16);
        let over = "a".repeat(17);

        assert!(validate(&exact, 16).is_ok());
        assert_eq!(
            validate(&over, 16),
            Err(InvalidKey::TooLong { length: 17, max: 16 })
        );
    }

    #[test]
    fn test_rejects_space_and_colon() {
        assert_eq!(
            validate("abc 123", 64),
            Err(InvalidKey::InvalidCharacter {
                character: ' ',
                position: 3
            })
        );
        assert_eq!(
            validate("abc:123", 64),
            Err(InvalidKey::InvalidCharacter {
                character: ':',
                position: 3
            })
        );
    }

    #[test]
    fn test_rejects_non_ascii() {
        assert!(matches!(
            validate("clé", 64),
            Err(InvalidKey::InvalidCharacter { character: 'é', .. })
        ));
    }

    #[test]
    fn test_composite_key_is_case_normalized() {
        let k = key("abc-123");
        let a = CompositeKey::build("post", "/Orders/", &k);
        let b = CompositeKey::build("POST", "/orders", &k);

        assert_eq!(a, b);
        assert_eq!(a.storage_key(), "POST:/orders:abc-123");
    }

    #[test]
    fn test_composite_key_separates_routes_and_methods() {
        let k = key("abc-123");
        let create = CompositeKey::build("POST", "/orders", &k);
        let update = CompositeKey::build("PUT", "/orders/{id}", &k);
        let invoice = CompositeKey::build("POST", "/invoices", &k);

        assert_ne!(create, update);
        assert_ne!(create, invoice);
        assert_ne!(create.storage_key(), update.storage_key());
    }

    #[test]
    fn test_key_case_is_preserved() {
        let upper = CompositeKey::build("POST", "/orders", &key("ABC"));
        let lower = CompositeKey::build("POST", "/orders", &key("abc"));
        assert_ne!(upper, lower);
    }

    #[test]
    fn test_route_without_leading_slash() {
        let k = key("abc");
        assert_eq!(CompositeKey::build("post", "orders", &k).route(), "/orders");
        assert_eq!(CompositeKey::build("post", "/", &k).route(), "/");
    }
}
