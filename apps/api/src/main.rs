mod auth;
mod billing;
mod config;
mod db;
mod entitlements;
mod errors;
mod monitoring;
mod rate_limit;
mod routes;
mod search;
mod state;
mod subscriptions;
#[cfg(test)]
mod test_support;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::api_keys::PgApiKeyStore;
use crate::billing::identity::{Auth0Directory, IdentityDirectory, NoopDirectory};
use crate::config::Config;
use crate::db::create_pool;
use crate::entitlements::usage::PgUsageStore;
use crate::monitoring::PgMonitoringStore;
use crate::rate_limit::RedisRateLimitStore;
use crate::routes::build_router;
use crate::search::{BreachSource, ElasticsearchSource, LeakCheckSource};
use crate::state::{AppState, Stores};
use crate::subscriptions::PgSubscriptionStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Obscura API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL (runs migrations)
    let db = create_pool(&config.database_url).await?;

    // Initialize Redis (rate limit counters)
    let redis = redis::Client::open(config.redis_url.clone())?;
    info!("Redis client initialized");

    let sources = build_sources(&config);
    let identity: Arc<dyn IdentityDirectory> = match config.auth0_management.clone() {
        Some(mgmt) => {
            info!("Identity sync enabled for {}", mgmt.domain);
            Arc::new(Auth0Directory::new(mgmt))
        }
        None => {
            warn!("AUTH0_DOMAIN not set; plan changes will not be mirrored to the identity provider");
            Arc::new(NoopDirectory)
        }
    };

    let stores = Stores {
        subscriptions: Arc::new(PgSubscriptionStore::new(db.clone())),
        usage: Arc::new(PgUsageStore::new(db.clone())),
        api_keys: Arc::new(PgApiKeyStore::new(db.clone())),
        monitoring: Arc::new(PgMonitoringStore::new(db)),
        rate_limiter: Arc::new(RedisRateLimitStore::new(redis)),
    };

    // Build app state
    let state = AppState::new(config.clone(), stores, sources, identity)?;
    info!(
        card = state.stripe.is_some(),
        crypto = state.nowpayments.is_some(),
        "Billing providers"
    );

    // Background monitoring scans
    state.scanner().spawn();

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins to PUBLIC_APP_URL

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    // Peer addresses feed the rate limiter when no better client key exists.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Breach sources enabled by configuration, in reporting order.
fn build_sources(config: &Config) -> Vec<Arc<dyn BreachSource>> {
    let mut sources: Vec<Arc<dyn BreachSource>> = Vec::new();
    if let Some(key) = &config.leakcheck_api_key {
        sources.push(Arc::new(LeakCheckSource::new(key.clone())));
    }
    if let Some(es) = &config.elasticsearch {
        sources.push(Arc::new(ElasticsearchSource::new(es.clone())));
    }
    if sources.is_empty() {
        warn!("No breach sources configured; search endpoints will reject every lookup");
    } else {
        info!(
            "Breach sources: {}",
            sources
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    sources
}
