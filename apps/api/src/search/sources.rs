//! Breach data providers.
//!
//! Every provider implements `BreachSource`. The aggregator holds them as
//! `Arc<dyn BreachSource>` and fans a query out to each one that supports the
//! lookup kind.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ElasticsearchConfig;
use crate::search::models::{BreachRecord, SearchKind};

const LEAKCHECK_API_URL: &str = "https://leakcheck.io";
const MAX_RETRIES: u32 = 3;
/// Upper bound on documents returned per Elasticsearch query.
const ES_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Source error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid source URL: {0}")]
    Url(String),

    #[error("Source timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait BreachSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, _kind: SearchKind) -> bool {
        true
    }

    async fn search(&self, query: &str, kind: SearchKind) -> Result<Vec<BreachRecord>, SourceError>;
}

fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

// ────────────────────────────────────────────────────────────────────────────
// LeakCheck
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LeakCheckResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: Vec<LeakCheckEntry>,
}

#[derive(Debug, Deserialize)]
struct LeakCheckEntry {
    email: Option<String>,
    username: Option<String>,
    password: Option<String>,
    phone: Option<String>,
    source: Option<LeakCheckBreach>,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct LeakCheckBreach {
    name: Option<String>,
    breach_date: Option<String>,
}

/// LeakCheck v2 query API.
pub struct LeakCheckSource {
    client: Client,
    api_key: String,
    base_url: String,
    retry_base: Duration,
}

impl LeakCheckSource {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, LEAKCHECK_API_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            client: http_client(Duration::from_secs(15)),
            api_key,
            base_url,
            retry_base: Duration::from_millis(500),
        }
    }

    fn query_url(&self, query: &str, kind: SearchKind) -> Result<Url, SourceError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| SourceError::Url(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| SourceError::Url(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["api", "v2", "query", query]);
        url.query_pairs_mut().append_pair("type", kind.as_str());
        Ok(url)
    }

    fn into_record(entry: LeakCheckEntry, kind: SearchKind, query: &str) -> BreachRecord {
        let (breach, breach_date) = entry
            .source
            .map(|s| (s.name, s.breach_date))
            .unwrap_or((None, None));
        let domain = match kind {
            SearchKind::Domain => Some(query.to_string()),
            _ => entry
                .email
                .as_deref()
                .and_then(|e| e.split_once('@'))
                .map(|(_, d)| d.to_lowercase()),
        };
        BreachRecord {
            source: "leakcheck".to_string(),
            breach,
            breach_date,
            email: entry.email,
            username: entry.username,
            domain,
            phone: entry.phone,
            password: entry.password,
            fields: entry.fields,
            extra: entry.extra,
            ..Default::default()
        }
    }
}

#[async_trait]
impl BreachSource for LeakCheckSource {
    fn name(&self) -> &'static str {
        "leakcheck"
    }

    fn supports(&self, kind: SearchKind) -> bool {
        kind != SearchKind::Cookie
    }

    /// Retries 429 and 5xx responses with exponential backoff.
    async fn search(&self, query: &str, kind: SearchKind) -> Result<Vec<BreachRecord>, SourceError> {
        let url = self.query_url(query, kind)?;
        let mut last_error: Option<SourceError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = self.retry_base * (1 << (attempt - 1));
                warn!("LeakCheck attempt {attempt} failed, retrying after {}ms", delay.as_millis());
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .get(url.clone())
                .header("X-API-Key", &self.api_key)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(SourceError::Http(e));
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                last_error = Some(SourceError::Api {
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
                continue;
            }
            if status.as_u16() == 404 {
                return Ok(Vec::new());
            }
            if !status.is_success() {
                return Err(SourceError::Api {
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
            }

            let body: LeakCheckResponse = response.json().await?;
            if !body.success {
                let message = body.error.unwrap_or_default();
                // LeakCheck reports an empty result as an error.
                if message.eq_ignore_ascii_case("not found") {
                    return Ok(Vec::new());
                }
                return Err(SourceError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            debug!(found = body.result.len(), %kind, "LeakCheck query succeeded");
            return Ok(body
                .result
                .into_iter()
                .map(|entry| Self::into_record(entry, kind, query))
                .collect());
        }

        Err(last_error.unwrap_or(SourceError::Api {
            status: 429,
            message: format!("gave up after {MAX_RETRIES} attempts"),
        }))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Elasticsearch
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EsResponse {
    hits: EsHits,
}

#[derive(Debug, Deserialize)]
struct EsHits {
    hits: Vec<EsHit>,
}

#[derive(Debug, Deserialize)]
struct EsHit {
    #[serde(rename = "_source")]
    source: EsDocument,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EsDocument {
    breach: Option<String>,
    breach_date: Option<String>,
    email: Option<String>,
    username: Option<String>,
    domain: Option<String>,
    phone: Option<String>,
    password: Option<String>,
    hash: Option<String>,
    cookie_name: Option<String>,
    cookie_value: Option<String>,
    fields: Vec<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Self-hosted breach index. Documents are flat records with keyword fields.
pub struct ElasticsearchSource {
    client: Client,
    config: ElasticsearchConfig,
}

impl ElasticsearchSource {
    pub fn new(config: ElasticsearchConfig) -> Self {
        Self {
            client: http_client(Duration::from_secs(10)),
            config,
        }
    }

    fn query_body(query: &str, kind: SearchKind) -> Value {
        let query = match kind {
            SearchKind::Cookie => json!({
                "bool": { "filter": [
                    { "term": { "domain": query } },
                    { "exists": { "field": "cookie_name" } }
                ]}
            }),
            other => json!({ "term": { other.as_str(): query } }),
        };
        json!({ "size": ES_PAGE_SIZE, "query": query })
    }
}

#[async_trait]
impl BreachSource for ElasticsearchSource {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    async fn search(&self, query: &str, kind: SearchKind) -> Result<Vec<BreachRecord>, SourceError> {
        let url = format!(
            "{}/{}/_search",
            self.config.url.trim_end_matches('/'),
            self.config.index
        );
        let response = self
            .client
            .post(&url)
            .json(&Self::query_body(query, kind))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body: EsResponse = response.json().await?;
        Ok(body
            .hits
            .hits
            .into_iter()
            .map(|hit| {
                let doc = hit.source;
                BreachRecord {
                    source: "elasticsearch".to_string(),
                    breach: doc.breach,
                    breach_date: doc.breach_date,
                    email: doc.email,
                    username: doc.username,
                    domain: doc.domain,
                    phone: doc.phone,
                    password: doc.password,
                    hash: doc.hash,
                    cookie_name: doc.cookie_name,
                    cookie_value: doc.cookie_value,
                    fields: doc.fields,
                    extra: doc.extra,
                }
            })
            .collect())
    }
}
