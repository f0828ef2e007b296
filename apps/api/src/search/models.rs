use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entitlements::redaction::{mask, Redact};
use crate::entitlements::tiers::Feature;
use crate::errors::AppError;

pub const MAX_QUERY_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    Email,
    Username,
    Domain,
    Phone,
    Password,
    Cookie,
}

impl SearchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchKind::Email => "email",
            SearchKind::Username => "username",
            SearchKind::Domain => "domain",
            SearchKind::Phone => "phone",
            SearchKind::Password => "password",
            SearchKind::Cookie => "cookie",
        }
    }

    /// The feature this lookup kind needs on top of `basic_search`, if any.
    pub fn required_feature(&self) -> Option<Feature> {
        match self {
            SearchKind::Domain => Some(Feature::DomainSearch),
            SearchKind::Cookie => Some(Feature::CookieLookup),
            _ => None,
        }
    }

    /// Trims and checks a raw query for this kind, returning the normalised form.
    pub fn normalize(&self, raw: &str) -> Result<String, AppError> {
        let query = raw.trim();
        if query.is_empty() {
            return Err(AppError::Validation("Query must not be empty".to_string()));
        }
        if query.chars().count() > MAX_QUERY_LEN {
            return Err(AppError::Validation(format!(
                "Query must be at most {MAX_QUERY_LEN} characters"
            )));
        }

        match self {
            SearchKind::Email => {
                if !query.contains('@') {
                    return Err(AppError::Validation(
                        "Email lookups need an address containing '@'".to_string(),
                    ));
                }
                Ok(query.to_lowercase())
            }
            SearchKind::Domain => {
                if !query.contains('.') || query.contains('@') {
                    return Err(AppError::Validation(
                        "Domain lookups need a bare domain like example.com".to_string(),
                    ));
                }
                Ok(query.to_lowercase())
            }
            // Passwords are case-sensitive; the rest are matched as given.
            _ => Ok(query.to_string()),
        }
    }
}

impl fmt::Display for SearchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub kind: SearchKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkSearchRequest {
    pub queries: Vec<String>,
    pub kind: SearchKind,
}

/// One exposure of an identifier, as reported by a breach source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreachRecord {
    /// Which provider reported the record.
    pub source: String,
    pub breach: Option<String>,
    pub breach_date: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
    pub domain: Option<String>,
    pub phone: Option<String>,
    pub password: Option<String>,
    pub hash: Option<String>,
    pub cookie_name: Option<String>,
    pub cookie_value: Option<String>,
    /// Names of the data classes exposed in the breach.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Source-specific attributes without a typed field.
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// Identity of a record for de-duplication across sources.
pub type RecordKey = (
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

impl BreachRecord {
    pub fn dedup_key(&self) -> RecordKey {
        (
            self.source.clone(),
            self.email.as_ref().map(|e| e.to_lowercase()),
            self.username.clone(),
            self.password.clone(),
            self.breach.clone(),
        )
    }
}

impl Redact for BreachRecord {
    fn redact(&mut self) {
        for secret in [&mut self.password, &mut self.hash, &mut self.cookie_value] {
            if let Some(value) = secret.as_mut() {
                *value = mask(value);
            }
        }

        let mut extra = Value::Object(std::mem::take(&mut self.extra));
        extra.redact();
        if let Value::Object(mut map) = extra {
            if self.cookie_name.is_some() {
                if let Some(Value::String(v)) = map.get_mut("value") {
                    *v = mask(v);
                }
            }
            self.extra = map;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub ok: bool,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub kind: SearchKind,
    pub total: usize,
    /// True when secret fields were masked for the caller's tier.
    pub redacted: bool,
    pub results: Vec<BreachRecord>,
    pub sources: Vec<SourceStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkItem {
    pub query: String,
    pub total: usize,
    pub results: Vec<BreachRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkSearchResponse {
    pub kind: SearchKind,
    pub redacted: bool,
    pub items: Vec<BulkItem>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::redaction::MASK;

    #[test]
    fn test_query_validation() {
        assert!(SearchKind::Email.normalize("   ").is_err());
        assert!(SearchKind::Email.normalize("not-an-email").is_err());
        assert_eq!(
            SearchKind::Email.normalize(" Jane@Example.com ").unwrap(),
            "jane@example.com"
        );
        assert!(SearchKind::Domain.normalize("example").is_err());
        assert!(SearchKind::Domain.normalize("a@example.com").is_err());
        assert_eq!(SearchKind::Domain.normalize("Example.COM").unwrap(), "example.com");
        assert_eq!(SearchKind::Password.normalize("HunTer2").unwrap(), "HunTer2");

        let long = "a".repeat(MAX_QUERY_LEN + 1);
        assert!(SearchKind::Username.normalize(&long).is_err());
        assert!(SearchKind::Username
            .normalize(&"a".repeat(MAX_QUERY_LEN))
            .is_ok());
    }

    #[test]
    fn test_kind_features() {
        assert_eq!(SearchKind::Email.required_feature(), None);
        assert_eq!(
            SearchKind::Domain.required_feature(),
            Some(Feature::DomainSearch)
        );
        assert_eq!(
            SearchKind::Cookie.required_feature(),
            Some(Feature::CookieLookup)
        );
    }

    #[test]
    fn test_record_redaction_keeps_context() {
        let mut record = BreachRecord {
            source: "leakcheck".into(),
            breach: Some("Acme 2021".into()),
            email: Some("jane@example.com".into()),
            password: Some("hunter2".into()),
            cookie_value: Some("sess=abc".into()),
            ..Default::default()
        };
        record.redact();
        assert_eq!(record.password.as_deref(), Some(MASK));
        assert_eq!(record.cookie_value.as_deref(), Some(MASK));
        assert_eq!(record.email.as_deref(), Some("jane@example.com"));
        assert_eq!(record.breach.as_deref(), Some("Acme 2021"));
        assert_eq!(record.hash, None);
    }

    #[test]
    fn test_record_redaction_reaches_extra_attributes() {
        let mut record: BreachRecord = serde_json::from_value(serde_json::json!({
            "source": "elasticsearch",
            "email": "jane@example.com",
            "cookie_name": "sid",
            "salt": "x9f2",
            "value": "s3cr3t",
            "profile": { "api_key": "ak_live_1", "city": "Lyon" },
            "ip": "10.0.0.1"
        }))
        .unwrap();
        record.redact();

        assert_eq!(record.extra["salt"], MASK);
        assert_eq!(record.extra["value"], MASK);
        assert_eq!(record.extra["profile"]["api_key"], MASK);
        assert_eq!(record.extra["profile"]["city"], "Lyon");
        assert_eq!(record.extra["ip"], "10.0.0.1");
        assert_eq!(record.email.as_deref(), Some("jane@example.com"));
    }

    #[test]
    fn test_dedup_key_ignores_email_case() {
        let a = BreachRecord {
            source: "es".into(),
            email: Some("Jane@Example.com".into()),
            ..Default::default()
        };
        let b = BreachRecord {
            email: Some("jane@example.com".into()),
            ..a.clone()
        };
        assert_eq!(a.dedup_key(), b.dedup_key());
    }
}
