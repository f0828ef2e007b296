//! In-memory application harness for router-level tests.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::auth::api_keys::{generate_key, hash_key, ApiKeyStore, InMemoryApiKeyStore};
use crate::auth::jwt::tests::{test_auth_config, TEST_SECRET};
use crate::billing::identity::NoopDirectory;
use crate::billing::nowpayments::tests::IPN_SECRET;
use crate::billing::stripe::tests::test_config as stripe_test_config;
use crate::config::{Config, NowPaymentsConfig, TierPrices};
use crate::entitlements::tiers::Tier;
use crate::entitlements::usage::InMemoryUsageStore;
use crate::monitoring::InMemoryMonitoringStore;
use crate::rate_limit::InMemoryRateLimitStore;
use crate::routes::build_router;
use crate::search::sources::tests::{leaked, StaticSource};
use crate::search::BreachSource;
use crate::state::{AppState, Stores};
use crate::subscriptions::{
    InMemorySubscriptionStore, PaymentMethod, SubscriptionStatus, SubscriptionStore,
    SubscriptionUpdate,
};

/// Far-future expiry so identical claims always produce identical tokens.
const TOKEN_EXP: i64 = 4_102_444_800;

pub fn test_config(rate_limit_per_minute: u32) -> Config {
    Config {
        database_url: "postgres://unused".into(),
        redis_url: "redis://unused".into(),
        port: 0,
        rust_log: "debug".into(),
        public_app_url: "https://app.obscuralabs.test".into(),
        auth: test_auth_config(),
        personal_account_emails: vec![TestApp::PERSONAL_EMAIL.to_string()],
        tier_prices: TierPrices::default(),
        stripe: Some(stripe_test_config()),
        nowpayments: Some(NowPaymentsConfig {
            api_key: "np-key".into(),
            ipn_secret: IPN_SECRET.into(),
            api_base: "https://api.nowpayments.io".into(),
        }),
        auth0_management: None,
        leakcheck_api_key: None,
        elasticsearch: None,
        monitoring_scan_interval_secs: 3600,
        rate_limit_per_minute,
    }
}

pub struct TestApp {
    pub state: AppState,
    pub subscriptions: Arc<InMemorySubscriptionStore>,
    pub usage: Arc<InMemoryUsageStore>,
    pub api_keys: Arc<InMemoryApiKeyStore>,
    pub monitoring: Arc<InMemoryMonitoringStore>,
}

impl TestApp {
    pub const PERSONAL_EMAIL: &'static str = "owner@obscuralabs.test";

    pub fn new() -> Self {
        Self::with_rate_limit(10_000)
    }

    pub fn with_rate_limit(per_minute: u32) -> Self {
        let mut record = leaked("jane@example.com", "hunter2", "Acme 2021");
        record.extra.insert("salt".into(), json!("x9f2"));
        Self::build(per_minute, StaticSource::new("static", vec![record]))
    }

    /// Serves every lookup from `source`.
    pub fn with_source(source: Arc<dyn BreachSource>) -> Self {
        Self::build(10_000, source)
    }

    fn build(per_minute: u32, source: Arc<dyn BreachSource>) -> Self {
        let subscriptions = Arc::new(InMemorySubscriptionStore::new());
        let usage = Arc::new(InMemoryUsageStore::new());
        let api_keys = Arc::new(InMemoryApiKeyStore::new());
        let monitoring = Arc::new(InMemoryMonitoringStore::new());

        let state = AppState::new(
            test_config(per_minute),
            Stores {
                subscriptions: subscriptions.clone(),
                usage: usage.clone(),
                api_keys: api_keys.clone(),
                monitoring: monitoring.clone(),
                rate_limiter: Arc::new(InMemoryRateLimitStore::new()),
            },
            vec![source],
            Arc::new(NoopDirectory),
        )
        .unwrap();

        Self {
            state,
            subscriptions,
            usage,
            api_keys,
            monitoring,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn token(sub: &str) -> String {
        Self::token_with(json!({ "sub": sub }))
    }

    fn token_with(mut claims: Value) -> String {
        claims["aud"] = json!("https://api.obscuralabs.io");
        claims["exp"] = json!(TOKEN_EXP);
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap()
    }

    /// Gives the user an active card subscription on `tier`.
    pub async fn set_tier(&self, sub: &str, tier: Tier) {
        self.subscriptions
            .upsert(&SubscriptionUpdate {
                user_sub: sub.to_string(),
                tier,
                status: SubscriptionStatus::Active,
                current_period_end: Some(Utc::now() + Duration::days(30)),
                payment_method: PaymentMethod::Card,
                stripe_customer_id: None,
                stripe_subscription_id: None,
            })
            .await
            .unwrap();
    }

    /// Mints an API key for the user directly in the store.
    pub async fn create_key(&self, sub: &str) -> String {
        let key = generate_key();
        self.api_keys
            .insert(sub, "test", &key[..10], &hash_key(&key))
            .await
            .unwrap();
        key
    }

    pub async fn raw(&self, request: Request<Body>) -> Response {
        self.router().oneshot(request).await.unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.raw(request).await;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn authed(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {token}"));
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    pub async fn get_as(&self, uri: &str, sub: &str) -> (StatusCode, Value) {
        self.send(Self::authed("GET", uri, &Self::token(sub), None))
            .await
    }

    pub async fn get_with_email(
        &self,
        uri: &str,
        sub: &str,
        email: &str,
        verified: bool,
    ) -> (StatusCode, Value) {
        let token = Self::token_with(json!({
            "sub": sub,
            "email": email,
            "email_verified": verified,
        }));
        self.send(Self::authed("GET", uri, &token, None)).await
    }

    pub async fn get_anonymous(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post_as(&self, uri: &str, sub: &str, body: Value) -> (StatusCode, Value) {
        self.send(Self::authed("POST", uri, &Self::token(sub), Some(body)))
            .await
    }

    pub async fn delete_as(&self, uri: &str, sub: &str) -> (StatusCode, Value) {
        self.send(Self::authed("DELETE", uri, &Self::token(sub), None))
            .await
    }

    pub async fn post_with_key(&self, uri: &str, key: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::post(uri)
                .header("x-api-key", key)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub async fn get_with_key(&self, uri: &str, key: &str) -> (StatusCode, Value) {
        self.send(
            Request::get(uri)
                .header("x-api-key", key)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    /// Sends `token` verbatim as the bearer credential.
    pub async fn get_with_bearer(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.send(Self::authed("GET", uri, token, None)).await
    }
}
