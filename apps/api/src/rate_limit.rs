//! Per-client request rate limiting.
//!
//! Fixed one-minute windows. Redis holds the counters in production so every
//! instance shares them; the in-memory store evicts finished windows on each
//! call so it never grows without bound.

#[cfg(test)]
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use redis::Client as RedisClient;
#[cfg(test)]
use tokio::sync::Mutex;
use tracing::warn;

use crate::auth::{api_key, api_keys::hash_key, bearer_token};
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
        }
    }

    fn window_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    fn from_count(count: u64, config: &RateLimitConfig, now_secs: u64) -> Self {
        let window = config.window_secs();
        let max = u64::from(config.max_requests);
        Self {
            allowed: count <= max,
            remaining: max.saturating_sub(count) as u32,
            retry_after_secs: window - (now_secs % window),
        }
    }
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Counts one request for `key` and reports whether it fits the window.
    async fn hit(&self, key: &str, config: &RateLimitConfig) -> Result<RateLimitDecision, AppError>;
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ────────────────────────────────────────────────────────────────────────────
// Redis
// ────────────────────────────────────────────────────────────────────────────

pub struct RedisRateLimitStore {
    client: RedisClient,
}

impl RedisRateLimitStore {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(&self, key: &str, config: &RateLimitConfig) -> Result<RateLimitDecision, AppError> {
        let now = unix_now();
        let window = config.window_secs();
        let bucket = format!("ratelimit:{key}:{}", now / window);

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await?;

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&bucket, 1u64)
            .expire(&bucket, window as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(RateLimitDecision::from_count(count, config, now))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    /// key -> (window index, count)
    windows: Mutex<HashMap<String, (u64, u64)>>,
}

#[cfg(test)]
impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn hit_at(&self, key: &str, config: &RateLimitConfig, now: u64) -> RateLimitDecision {
        let window_index = now / config.window_secs();
        let mut windows = self.windows.lock().await;
        windows.retain(|_, (index, _)| *index == window_index);

        let entry = windows.entry(key.to_string()).or_insert((window_index, 0));
        entry.1 += 1;
        RateLimitDecision::from_count(entry.1, config, now)
    }

    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }
}

#[cfg(test)]
#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn hit(&self, key: &str, config: &RateLimitConfig) -> Result<RateLimitDecision, AppError> {
        Ok(self.hit_at(key, config, unix_now()).await)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Middleware
// ────────────────────────────────────────────────────────────────────────────

/// Identifies the caller without doing a full authentication round trip.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(key) = api_key(headers) {
        return format!("key:{}", &hash_key(key)[..16]);
    }
    if let Some(token) = bearer_token(headers) {
        return format!("token:{}", &hash_key(token)[..16]);
    }
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match (forwarded, peer) {
        (Some(ip), _) => format!("ip:{ip}"),
        (None, Some(addr)) => format!("ip:{}", addr.ip()),
        (None, None) => "unknown".to_string(),
    }
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(request.headers(), peer);

    match state.rate_limiter.hit(&key, &state.rate_limit).await {
        Ok(decision) if !decision.allowed => {
            return Err(AppError::RateLimited {
                retry_after_secs: decision.retry_after_secs,
            });
        }
        Ok(_) => {}
        // Limiter backend outages must not take the API down with them.
        Err(e) => warn!("Rate limiter unavailable, allowing request: {e}"),
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_fixed_window_allows_then_rejects() {
        let store = InMemoryRateLimitStore::new();
        let config = RateLimitConfig::per_minute(3);
        let now = 1_800_000_000 - (1_800_000_000 % 60);

        for expected_remaining in [2, 1, 0] {
            let d = store.hit_at("ip:1.2.3.4", &config, now).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }
        let d = store.hit_at("ip:1.2.3.4", &config, now + 10).await;
        assert!(!d.allowed);
        assert_eq!(d.retry_after_secs, 50);

        // Next window starts fresh.
        let d = store.hit_at("ip:1.2.3.4", &config, now + 60).await;
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn test_expired_windows_are_evicted() {
        let store = InMemoryRateLimitStore::new();
        let config = RateLimitConfig::per_minute(10);
        let now = 1_800_000_000;
        for i in 0..50 {
            store.hit_at(&format!("ip:10.0.0.{i}"), &config, now).await;
        }
        assert_eq!(store.tracked_keys().await, 50);
        store.hit_at("ip:late", &config, now + 120).await;
        assert_eq!(store.tracked_keys().await, 1);
    }

    #[test]
    fn test_client_key_precedence() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "192.0.2.7:5555".parse().unwrap();
        assert_eq!(client_key(&headers, Some(peer)), "ip:192.0.2.7");
        assert_eq!(client_key(&headers, None), "unknown");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        assert_eq!(client_key(&headers, Some(peer)), "ip:203.0.113.9");

        headers.insert("x-api-key", HeaderValue::from_static("obs_abc"));
        assert!(client_key(&headers, Some(peer)).starts_with("key:"));
    }
}
