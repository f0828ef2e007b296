//! Redaction of secret-bearing fields for tiers without `unredacted_results`.
//!
//! Only the values of password-like and token-like fields are replaced. Context
//! fields (email, domain, source, dates) always pass through untouched so that a
//! free user can still see *where* they were exposed.

use serde_json::Value;

use crate::entitlements::tiers::{Feature, Tier};

/// Fixed-width mask. The length of the original secret is never leaked.
pub const MASK: &str = "********";

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "pass",
    "passwd",
    "hash",
    "password_hash",
    "salt",
    "token",
    "access_token",
    "refresh_token",
    "session",
    "secret",
    "api_key",
    "cookie",
    "cookie_value",
];

/// Returns true if a field with this name carries a secret.
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&key.as_str())
}

/// Masks a single secret value. Empty strings stay empty.
pub fn mask(value: &str) -> String {
    if value.is_empty() {
        String::new()
    } else {
        MASK.to_string()
    }
}

/// Something whose secret fields can be masked in place.
pub trait Redact {
    fn redact(&mut self);
}

impl Redact for Value {
    fn redact(&mut self) {
        match self {
            Value::Object(map) => {
                // Cookie records keep the secret under a generic "value" key.
                let is_cookie = map.contains_key("cookie_name")
                    || map.get("kind").and_then(Value::as_str) == Some("cookie");
                for (key, v) in map.iter_mut() {
                    let sensitive = is_sensitive_key(key) || (is_cookie && key == "value");
                    match v {
                        Value::String(s) if sensitive => *s = mask(s),
                        Value::Object(_) | Value::Array(_) => v.redact(),
                        _ => {}
                    }
                }
            }
            Value::Array(items) => items.iter_mut().for_each(Redact::redact),
            _ => {}
        }
    }
}

/// Applies redaction when the tier does not include unredacted results.
/// A no-op for every tier that does.
pub fn redact_for_tier<T: Redact>(tier: Tier, mut items: Vec<T>) -> Vec<T> {
    if !tier.has_feature(Feature::UnredactedResults) {
        items.iter_mut().for_each(Redact::redact);
    }
    items
}
