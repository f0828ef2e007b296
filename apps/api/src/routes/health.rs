use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
/// Returns service status, version and which integrations are switched on.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "obscura-api",
        "breach_sources": state.search.source_names(),
        "billing": {
            "card": state.stripe.is_some(),
            "crypto": state.nowpayments.is_some(),
        }
    }))
}
