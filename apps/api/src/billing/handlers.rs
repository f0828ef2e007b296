use axum::{extract::State, http::HeaderMap, Json};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::CurrentUser;
use crate::billing::nowpayments::{self, InvoiceUrls};
use crate::billing::stripe;
use crate::billing::{SignatureError, WebhookOutcome};
use crate::entitlements::tiers::Tier;
use crate::errors::AppError;
use crate::state::AppState;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(SignatureError::Missing)
}

// ────────────────────────────────────────────────────────────────────────────
// Webhooks
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/webhooks/stripe
///
/// Verifies the raw body before parsing it. Unknown event types are
/// acknowledged so Stripe stops retrying them.
pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookOutcome>, AppError> {
    let client = state
        .stripe
        .as_ref()
        .ok_or_else(|| AppError::NotFound("Stripe billing is not configured".to_string()))?;

    let signature = header_str(&headers, stripe::SIGNATURE_HEADER)?;
    let payload = std::str::from_utf8(&body).map_err(|_| SignatureError::Malformed)?;
    let event = stripe::verify_event(payload, signature, &client.config().webhook_secret)?;
    info!(event_id = %event.id, event_type = ?event.type_, "Stripe webhook received");

    let change = stripe::interpret(&event, client.config())?;
    Ok(Json(state.billing.apply_stripe(change).await?))
}

/// POST /api/webhooks/nowpayments
pub async fn handle_nowpayments_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookOutcome>, AppError> {
    let client = state
        .nowpayments
        .as_ref()
        .ok_or_else(|| AppError::NotFound("Crypto billing is not configured".to_string()))?;

    let signature = header_str(&headers, nowpayments::SIGNATURE_HEADER)?;
    let payment = nowpayments::verify_ipn(&body, signature, &client.config().ipn_secret)?;
    info!(
        payment_id = %payment.payment_id,
        status = %payment.payment_status,
        "NOWPayments IPN received"
    );

    let change = nowpayments::interpret(&payment, &state.config.tier_prices, Utc::now())?;
    Ok(Json(state.billing.apply_ipn(change).await?))
}

// ────────────────────────────────────────────────────────────────────────────
// Checkout
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub tier: Tier,
}

#[derive(Debug, Serialize)]
pub struct RedirectResponse {
    pub url: String,
}

fn purchasable(tier: Tier) -> Result<Tier, AppError> {
    if tier.is_paid() {
        Ok(tier)
    } else {
        Err(AppError::Validation(format!("The {tier} plan cannot be purchased")))
    }
}

async fn email_for(state: &AppState, user: &CurrentUser) -> Result<Option<String>, AppError> {
    match &user.email {
        Some(email) => Ok(Some(email.clone())),
        None => state.subscriptions.user_email(&user.sub).await,
    }
}

/// POST /api/billing/checkout
pub async fn handle_checkout(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<RedirectResponse>, AppError> {
    let tier = purchasable(req.tier)?;
    let client = state
        .stripe
        .as_ref()
        .ok_or_else(|| AppError::NotFound("Card billing is not configured".to_string()))?;

    let email = email_for(&state, &user).await?;
    let base = state.config.public_app_url.trim_end_matches('/');
    let url = client
        .create_checkout_session(
            &user.sub,
            email.as_deref(),
            tier,
            &format!("{base}/account?checkout=success"),
            &format!("{base}/pricing?checkout=cancelled"),
        )
        .await?;

    info!(user = %user.sub, %tier, "Checkout session created");
    Ok(Json(RedirectResponse { url }))
}

/// POST /api/billing/portal
pub async fn handle_portal(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<RedirectResponse>, AppError> {
    let client = state
        .stripe
        .as_ref()
        .ok_or_else(|| AppError::NotFound("Card billing is not configured".to_string()))?;

    let customer_id = state
        .subscriptions
        .get(&user.sub)
        .await?
        .and_then(|s| s.stripe_customer_id)
        .ok_or_else(|| AppError::NotFound("No card billing account on file".to_string()))?;

    let base = state.config.public_app_url.trim_end_matches('/');
    let url = client
        .create_portal_session(&customer_id, &format!("{base}/account"))
        .await?;
    Ok(Json(RedirectResponse { url }))
}

/// POST /api/billing/crypto/checkout
pub async fn handle_crypto_checkout(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<RedirectResponse>, AppError> {
    let tier = purchasable(req.tier)?;
    let client = state
        .nowpayments
        .as_ref()
        .ok_or_else(|| AppError::NotFound("Crypto billing is not configured".to_string()))?;
    let amount = state.config.tier_prices.price_of(tier).ok_or_else(|| {
        warn!(%tier, "Paid tier has no configured price");
        AppError::Validation(format!("The {tier} plan cannot be purchased"))
    })?;

    let base = state.config.public_app_url.trim_end_matches('/');
    let ipn_callback = format!("{base}/api/webhooks/nowpayments");
    let success = format!("{base}/account?checkout=success");
    let cancel = format!("{base}/pricing?checkout=cancelled");
    let url = client
        .create_invoice(
            &user.sub,
            tier,
            amount,
            InvoiceUrls {
                ipn_callback: &ipn_callback,
                success: &success,
                cancel: &cancel,
            },
        )
        .await?;

    info!(user = %user.sub, %tier, amount, "Crypto invoice created");
    Ok(Json(RedirectResponse { url }))
}
