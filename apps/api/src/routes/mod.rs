pub mod account;
pub mod health;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use crate::auth::api_keys;
use crate::billing::handlers as billing;
use crate::monitoring::handlers as monitoring;
use crate::rate_limit::rate_limit_middleware;
use crate::search::handlers as search;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    // Caller-facing API, rate limited per client.
    let api = Router::new()
        .route("/api/account", get(account::handle_get_account))
        // Search
        .route("/api/search", post(search::handle_search))
        .route("/api/search/bulk", post(search::handle_bulk_search))
        .route("/api/v1/search", post(search::handle_api_search))
        // Monitoring
        .route(
            "/api/monitoring/targets",
            get(monitoring::handle_list_targets).post(monitoring::handle_create_target),
        )
        .route(
            "/api/monitoring/targets/:id",
            delete(monitoring::handle_delete_target),
        )
        .route(
            "/api/monitoring/targets/:id/scan",
            post(monitoring::handle_scan_target),
        )
        // API keys
        .route(
            "/api/keys",
            get(api_keys::handle_list_keys).post(api_keys::handle_create_key),
        )
        .route("/api/keys/:id", delete(api_keys::handle_revoke_key))
        // Billing
        .route("/api/billing/checkout", post(billing::handle_checkout))
        .route("/api/billing/portal", post(billing::handle_portal))
        .route(
            "/api/billing/crypto/checkout",
            post(billing::handle_crypto_checkout),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health::health_handler))
        // Provider webhooks are signed and retried by the provider; never throttled.
        .route("/api/webhooks/stripe", post(billing::handle_stripe_webhook))
        .route(
            "/api/webhooks/nowpayments",
            post(billing::handle_nowpayments_webhook),
        )
        .merge(api)
        .with_state(state)
}
