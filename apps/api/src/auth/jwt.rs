use std::collections::HashMap;

use anyhow::{Context, Result};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::auth::{AuthMethod, CurrentUser};
use crate::config::AuthConfig;
use crate::entitlements::tiers::Tier;
use crate::errors::AppError;

/// Claims of an identity-provider access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Verifies bearer tokens against the identity provider's signing key.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
    plan_claim: String,
}

impl JwtVerifier {
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let (key, algorithm) = match (&config.jwt_public_key_pem, &config.jwt_secret) {
            (Some(pem), _) => (
                DecodingKey::from_rsa_pem(pem.as_bytes()).context("Invalid RS256 public key")?,
                Algorithm::RS256,
            ),
            (None, Some(secret)) => (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256),
            (None, None) => anyhow::bail!("No JWT verification key configured"),
        };

        let mut validation = Validation::new(algorithm);
        match &config.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        if let Some(iss) = &config.issuer {
            validation.set_issuer(&[iss]);
        }

        Ok(Self {
            key,
            validation,
            plan_claim: config.plan_claim.clone(),
        })
    }

    pub fn verify(&self, token: &str) -> Result<CurrentUser, AppError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            debug!("Rejected bearer token: {e}");
            AppError::Unauthorized
        })?;
        let claims = data.claims;
        // Unverified addresses must not unlock email-based overrides.
        let verified = claims.email_verified == Some(true);

        Ok(CurrentUser {
            plan_claim: self.plan_from(&claims),
            sub: claims.sub,
            email: claims.email.filter(|_| verified),
            via: AuthMethod::Session,
        })
    }

    /// Reads the cached plan from either the namespaced claim or `app_metadata.plan`.
    fn plan_from(&self, claims: &Claims) -> Option<Tier> {
        claims
            .extra
            .get(&self.plan_claim)
            .or_else(|| claims.extra.get("app_metadata").and_then(|m| m.get("plan")))
            .and_then(Value::as_str)
            .and_then(|p| p.parse().ok())
    }
}
