//! API keys for programmatic access. Only the SHA-256 of a key is stored; the
//! plaintext is returned exactly once, at creation.

#[cfg(test)]
use std::collections::HashMap;

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool};
#[cfg(test)]
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::{AuthMethod, CurrentUser};
use crate::entitlements::{Feature, Requirement};
use crate::errors::AppError;
use crate::state::AppState;

pub const KEY_PREFIX: &str = "obs_";

/// Returns a fresh plaintext key: `obs_` followed by 48 hex characters.
pub fn generate_key() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{KEY_PREFIX}{}", hex::encode(bytes))
}

pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub name: String,
    /// First characters of the key, shown so users can tell keys apart.
    pub display_prefix: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn insert(
        &self,
        user_sub: &str,
        name: &str,
        display_prefix: &str,
        key_hash: &str,
    ) -> Result<ApiKeyRecord, AppError>;

    async fn list(&self, user_sub: &str) -> Result<Vec<ApiKeyRecord>, AppError>;

    /// Returns false when no key with this id belongs to the user.
    async fn revoke(&self, user_sub: &str, id: Uuid) -> Result<bool, AppError>;

    /// Looks up the owner of a key by hash and marks the key as used.
    async fn authenticate(&self, key_hash: &str) -> Result<Option<CurrentUser>, AppError>;
}

pub struct PgApiKeyStore {
    pool: PgPool,
}

impl PgApiKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct KeyOwnerRow {
    user_sub: String,
    email: Option<String>,
}

#[async_trait]
impl ApiKeyStore for PgApiKeyStore {
    async fn insert(
        &self,
        user_sub: &str,
        name: &str,
        display_prefix: &str,
        key_hash: &str,
    ) -> Result<ApiKeyRecord, AppError> {
        let record = sqlx::query_as(
            r#"
            INSERT INTO api_keys (user_sub, name, display_prefix, key_hash)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, display_prefix, created_at, last_used_at
            "#,
        )
        .bind(user_sub)
        .bind(name)
        .bind(display_prefix)
        .bind(key_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list(&self, user_sub: &str) -> Result<Vec<ApiKeyRecord>, AppError> {
        let records = sqlx::query_as(
            r#"
            SELECT id, name, display_prefix, created_at, last_used_at
            FROM api_keys
            WHERE user_sub = $1 AND revoked_at IS NULL
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_sub)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn revoke(&self, user_sub: &str, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = now() WHERE id = $1 AND user_sub = $2 AND revoked_at IS NULL",
        )
        .bind(id)
        .bind(user_sub)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn authenticate(&self, key_hash: &str) -> Result<Option<CurrentUser>, AppError> {
        let owner: Option<KeyOwnerRow> = sqlx::query_as(
            r#"
            UPDATE api_keys k SET last_used_at = now()
            FROM users u
            WHERE k.key_hash = $1 AND k.revoked_at IS NULL AND u.sub = k.user_sub
            RETURNING k.user_sub, u.email
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(owner.map(|o| CurrentUser {
            sub: o.user_sub,
            email: o.email,
            plan_claim: None,
            via: AuthMethod::ApiKey,
        }))
    }
}

#[cfg(test)]
struct StoredKey {
    user_sub: String,
    email: Option<String>,
    key_hash: String,
    record: ApiKeyRecord,
}

/// In-memory key store for tests. Owner emails are registered up front.
#[cfg(test)]
#[derive(Default)]
pub struct InMemoryApiKeyStore {
    keys: RwLock<Vec<StoredKey>>,
    emails: RwLock<HashMap<String, String>>,
}

#[cfg(test)]
impl InMemoryApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_email(&self, user_sub: &str, email: &str) {
        self.emails
            .write()
            .await
            .insert(user_sub.to_string(), email.to_string());
    }
}

#[cfg(test)]
#[async_trait]
impl ApiKeyStore for InMemoryApiKeyStore {
    async fn insert(
        &self,
        user_sub: &str,
        name: &str,
        display_prefix: &str,
        key_hash: &str,
    ) -> Result<ApiKeyRecord, AppError> {
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            display_prefix: display_prefix.to_string(),
            created_at: Utc::now(),
            last_used_at: None,
        };
        let email = self.emails.read().await.get(user_sub).cloned();
        self.keys.write().await.push(StoredKey {
            user_sub: user_sub.to_string(),
            email,
            key_hash: key_hash.to_string(),
            record: record.clone(),
        });
        Ok(record)
    }

    async fn list(&self, user_sub: &str) -> Result<Vec<ApiKeyRecord>, AppError> {
        Ok(self
            .keys
            .read()
            .await
            .iter()
            .filter(|k| k.user_sub == user_sub)
            .map(|k| k.record.clone())
            .collect())
    }

    async fn revoke(&self, user_sub: &str, id: Uuid) -> Result<bool, AppError> {
        let mut keys = self.keys.write().await;
        let before = keys.len();
        keys.retain(|k| !(k.user_sub == user_sub && k.record.id == id));
        Ok(keys.len() < before)
    }

    async fn authenticate(&self, key_hash: &str) -> Result<Option<CurrentUser>, AppError> {
        let mut keys = self.keys.write().await;
        Ok(keys.iter_mut().find(|k| k.key_hash == key_hash).map(|k| {
            k.record.last_used_at = Some(Utc::now());
            CurrentUser {
                sub: k.user_sub.clone(),
                email: k.email.clone(),
                plan_claim: None,
                via: AuthMethod::ApiKey,
            }
        }))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
}

#[derive(Serialize)]
pub struct CreatedKeyResponse {
    #[serde(flatten)]
    pub record: ApiKeyRecord,
    /// Shown once. Never retrievable again.
    pub key: String,
}

/// POST /api/keys
pub async fn handle_create_key(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<CreatedKeyResponse>), AppError> {
    // Keys cannot mint further keys.
    if user.via == AuthMethod::ApiKey {
        return Err(AppError::Forbidden);
    }
    let name = req.name.trim();
    if name.is_empty() || name.len() > 64 {
        return Err(AppError::Validation(
            "Key name must be 1-64 characters".to_string(),
        ));
    }

    state
        .guard()
        .check(&user, &[Requirement::Feature(Feature::ApiAccess)])
        .await?;

    state
        .subscriptions
        .upsert_user(&user.sub, user.email.as_deref())
        .await?;

    let key = generate_key();
    let display_prefix = &key[..KEY_PREFIX.len() + 6];
    let record = state
        .api_keys
        .insert(&user.sub, name, display_prefix, &hash_key(&key))
        .await?;

    tracing::info!(user = %user.sub, key_id = %record.id, "API key created");
    Ok((StatusCode::CREATED, Json(CreatedKeyResponse { record, key })))
}

/// GET /api/keys
pub async fn handle_list_keys(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<Vec<ApiKeyRecord>>, AppError> {
    Ok(Json(state.api_keys.list(&user.sub).await?))
}

/// DELETE /api/keys/:id
pub async fn handle_revoke_key(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if state.api_keys.revoke(&user.sub, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("API key {id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_prefixed_and_unique() {
        let a = generate_key();
        let b = generate_key();
        assert!(a.starts_with(KEY_PREFIX));
        assert_eq!(a.len(), KEY_PREFIX.len() + 48);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let h = hash_key("obs_abc");
        assert_eq!(h, hash_key("obs_abc"));
        assert_eq!(h.len(), 64);
        assert_ne!(h, hash_key("obs_abd"));
    }

    #[tokio::test]
    async fn test_in_memory_authenticate_and_revoke() {
        let store = InMemoryApiKeyStore::new();
        store.set_email("auth0|k", "k@obscura.io").await;
        let record = store
            .insert("auth0|k", "ci", "obs_123456", &hash_key("obs_secret"))
            .await
            .unwrap();

        let user = store
            .authenticate(&hash_key("obs_secret"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.sub, "auth0|k");
        assert_eq!(user.email.as_deref(), Some("k@obscura.io"));
        assert_eq!(user.via, AuthMethod::ApiKey);

        assert!(!store.revoke("someone-else", record.id).await.unwrap());
        assert!(store.revoke("auth0|k", record.id).await.unwrap());
        assert!(store
            .authenticate(&hash_key("obs_secret"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_key_routes() {
        use crate::entitlements::tiers::Tier;
        use crate::test_support::TestApp;
        use axum::http::StatusCode;
        use serde_json::json;

        let app = TestApp::new();
        let (status, body) = app
            .post_as("/api/keys", "auth0|free", json!({"name": "ci"}))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "FEATURE_NOT_INCLUDED");

        app.set_tier("auth0|pro", Tier::Professional).await;
        let (status, created) = app
            .post_as("/api/keys", "auth0|pro", json!({"name": "ci"}))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let key = created["key"].as_str().unwrap().to_string();
        assert!(key.starts_with(KEY_PREFIX));
        assert!(key.starts_with(created["display_prefix"].as_str().unwrap()));

        let (_, list) = app.get_as("/api/keys", "auth0|pro").await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert!(list[0].get("key").is_none());

        let (status, account) = app.get_with_key("/api/account", &key).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(account["user"]["via"], "api_key");

        let (status, account) = app.get_with_bearer("/api/account", &key).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(account["user"]["via"], "api_key");
        let (status, _) = app
            .get_with_bearer("/api/account", "obs_0000notarealkey")
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // A key cannot mint more keys.
        let (status, _) = app
            .post_with_key("/api/keys", &key, json!({"name": "nested"}))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let id = created["id"].as_str().unwrap();
        let (status, _) = app.delete_as(&format!("/api/keys/{id}"), "auth0|pro").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = app.get_with_key("/api/account", &key).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
