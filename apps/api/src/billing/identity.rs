//! Mirrors a user's plan into the identity provider's `app_metadata`.
//!
//! The subscription table stays authoritative; this copy only lets the
//! frontend read the plan from the session token without an API round trip.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Auth0ManagementConfig;
use crate::entitlements::tiers::Tier;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Identity provider error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid identity provider URL: {0}")]
    Url(String),
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn sync_plan(&self, user_sub: &str, tier: Tier) -> Result<(), IdentityError>;
}

/// Used when no management credentials are configured.
pub struct NoopDirectory;

#[async_trait]
impl IdentityDirectory for NoopDirectory {
    async fn sync_plan(&self, user_sub: &str, tier: Tier) -> Result<(), IdentityError> {
        debug!(user = user_sub, %tier, "Identity sync disabled; skipping");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Auth0 Management API client (client-credentials grant).
pub struct Auth0Directory {
    client: Client,
    config: Auth0ManagementConfig,
    token: Mutex<Option<CachedToken>>,
}

impl Auth0Directory {
    pub fn new(config: Auth0ManagementConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            config,
            token: Mutex::new(None),
        }
    }

    fn base_url(&self) -> String {
        let domain = self.config.domain.trim_end_matches('/');
        if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.to_string()
        } else {
            format!("https://{domain}")
        }
    }

    async fn access_token(&self) -> Result<String, IdentityError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let base = self.base_url();
        let response = self
            .client
            .post(format!("{base}/oauth/token"))
            .json(&json!({
                "grant_type": "client_credentials",
                "client_id": self.config.client_id,
                "client_secret": self.config.client_secret,
                "audience": format!("{base}/api/v2/"),
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IdentityError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let token: TokenResponse = response.json().await?;
        // Refresh a minute early so a token never expires mid-request.
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    fn user_url(&self, user_sub: &str) -> Result<Url, IdentityError> {
        let url = format!("{}/api/v2/users/{}", self.base_url(), encode_segment(user_sub));
        Url::parse(&url).map_err(|e| IdentityError::Url(e.to_string()))
    }
}

/// Percent-encodes everything outside the RFC 3986 unreserved set, so
/// subjects like `auth0|abc` survive as a single path segment.
fn encode_segment(raw: &str) -> String {
    raw.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

#[async_trait]
impl IdentityDirectory for Auth0Directory {
    async fn sync_plan(&self, user_sub: &str, tier: Tier) -> Result<(), IdentityError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .patch(self.user_url(user_sub)?)
            .bearer_auth(token)
            .json(&json!({ "app_metadata": { "plan": tier.as_str() } }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IdentityError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        debug!(user = user_sub, %tier, "Synced plan to identity provider");
        Ok(())
    }
}
