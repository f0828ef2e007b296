//! Caller authentication.
//!
//! Browser sessions present the identity provider's access token as a bearer
//! token. Programmatic clients present an API key, either in `x-api-key` or as
//! the bearer token itself. Both resolve to a `CurrentUser`, which handlers
//! take as an extractor.

pub mod api_keys;
pub mod jwt;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use serde::Serialize;

use crate::entitlements::tiers::Tier;
use crate::errors::AppError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Session,
    ApiKey,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentUser {
    /// Identity provider subject, e.g. `auth0|64f...`.
    pub sub: String,
    pub email: Option<String>,
    /// Plan cached in the identity provider. Informational only.
    #[serde(skip)]
    pub plan_claim: Option<Tier>,
    pub via: AuthMethod,
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let bearer = bearer_token(&parts.headers);
        let key = api_key(&parts.headers)
            .or_else(|| bearer.filter(|t| t.starts_with(api_keys::KEY_PREFIX)));
        if let Some(key) = key {
            return state
                .api_keys
                .authenticate(&api_keys::hash_key(key))
                .await?
                .ok_or(AppError::Unauthorized);
        }

        state.jwt.verify(bearer.ok_or(AppError::Unauthorized)?)
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|k| !k.is_empty())
}
