//! Billing: turns payment-provider events into subscription writes.
//!
//! Both providers funnel into `BillingService::commit`, which writes the
//! subscription row first and mirrors the plan to the identity provider second.
//! Providers retry failed webhooks, and every write is an upsert, so a replayed
//! event converges on the same row.

pub mod handlers;
pub mod identity;
pub mod nowpayments;
pub mod stripe;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::entitlements::tiers::Tier;
use crate::errors::AppError;
use crate::subscriptions::{
    PaymentMethod, Subscription, SubscriptionStatus, SubscriptionStore, SubscriptionUpdate,
};
use identity::IdentityDirectory;
use nowpayments::IpnChange;
use stripe::StripeChange;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,
    #[error("signature header or payload malformed")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

impl From<SignatureError> for AppError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::Missing | SignatureError::Malformed => {
                AppError::Validation(format!("Invalid webhook: {err}"))
            }
            SignatureError::Expired | SignatureError::Mismatch => AppError::InvalidSignature,
        }
    }
}

/// Result of applying a webhook, echoed back to the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Updated {
        user_sub: String,
        tier: Tier,
        status: SubscriptionStatus,
    },
    Ignored {
        reason: String,
    },
}

impl WebhookOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        WebhookOutcome::Ignored {
            reason: reason.into(),
        }
    }
}

/// Whether a Stripe event about `subscription_id` concerns something other
/// than the plan currently on file: a different Stripe subscription, or a
/// prepaid crypto plan that is still running.
fn superseded(current: &Subscription, subscription_id: Option<&str>) -> bool {
    if current.payment_method == Some(PaymentMethod::Crypto)
        && current.effective_tier(Utc::now()).is_paid()
    {
        return true;
    }
    match (current.stripe_subscription_id.as_deref(), subscription_id) {
        (Some(on_file), Some(incoming)) => on_file != incoming,
        _ => false,
    }
}

#[derive(Clone)]
pub struct BillingService {
    store: Arc<dyn SubscriptionStore>,
    identity: Arc<dyn IdentityDirectory>,
}

impl BillingService {
    pub fn new(store: Arc<dyn SubscriptionStore>, identity: Arc<dyn IdentityDirectory>) -> Self {
        Self { store, identity }
    }

    pub async fn apply_stripe(&self, change: StripeChange) -> Result<WebhookOutcome, AppError> {
        match change {
            StripeChange::CheckoutCompleted {
                user_sub,
                tier,
                customer_id,
                subscription_id,
            } => {
                self.commit(SubscriptionUpdate {
                    user_sub,
                    tier,
                    status: SubscriptionStatus::Active,
                    current_period_end: None,
                    payment_method: PaymentMethod::Card,
                    stripe_customer_id: customer_id,
                    stripe_subscription_id: subscription_id,
                })
                .await
            }
            StripeChange::SubscriptionChanged {
                subscription_id,
                customer_id,
                user_sub,
                tier,
                status,
                current_period_end,
            } => {
                let existing = self
                    .find_stripe_owner(Some(&subscription_id), user_sub.as_deref(), customer_id.as_deref())
                    .await?;
                if let Some(current) = existing
                    .as_ref()
                    .filter(|s| superseded(s, Some(&subscription_id)))
                {
                    info!(
                        user = %current.user_sub,
                        subscription = %subscription_id,
                        "Ignoring event for a superseded Stripe subscription"
                    );
                    return Ok(WebhookOutcome::ignored("superseded subscription"));
                }

                let Some(owner) = existing
                    .as_ref()
                    .map(|s| s.user_sub.clone())
                    .or(user_sub)
                else {
                    warn!(subscription = %subscription_id, "Stripe subscription has no known owner");
                    return Ok(WebhookOutcome::ignored("unknown subscription owner"));
                };
                let Some(tier) = tier.or(existing.as_ref().map(|s| s.tier)) else {
                    warn!(subscription = %subscription_id, "Stripe subscription price is not a known plan");
                    return Ok(WebhookOutcome::ignored("unknown price"));
                };

                self.commit(SubscriptionUpdate {
                    user_sub: owner,
                    tier,
                    status,
                    current_period_end,
                    payment_method: PaymentMethod::Card,
                    stripe_customer_id: customer_id,
                    stripe_subscription_id: Some(subscription_id),
                })
                .await
            }
            StripeChange::PaymentFailed {
                subscription_id,
                customer_id,
            } => {
                let Some(existing) = self
                    .find_stripe_owner(subscription_id.as_deref(), None, customer_id.as_deref())
                    .await?
                else {
                    return Ok(WebhookOutcome::ignored("payment failure for unknown customer"));
                };
                if superseded(&existing, subscription_id.as_deref()) {
                    info!(
                        user = %existing.user_sub,
                        subscription = subscription_id.as_deref().unwrap_or("-"),
                        "Ignoring payment failure for a superseded Stripe subscription"
                    );
                    return Ok(WebhookOutcome::ignored("superseded subscription"));
                }
                self.commit(SubscriptionUpdate {
                    user_sub: existing.user_sub,
                    tier: existing.tier,
                    status: SubscriptionStatus::PastDue,
                    current_period_end: existing.current_period_end,
                    payment_method: PaymentMethod::Card,
                    stripe_customer_id: customer_id.or(existing.stripe_customer_id),
                    stripe_subscription_id: subscription_id.or(existing.stripe_subscription_id),
                })
                .await
            }
            StripeChange::Ignored(reason) => Ok(WebhookOutcome::ignored(reason)),
        }
    }

    pub async fn apply_ipn(&self, change: IpnChange) -> Result<WebhookOutcome, AppError> {
        match change {
            IpnChange::Activate {
                user_sub,
                tier,
                period_end,
            } => {
                self.commit(SubscriptionUpdate {
                    user_sub,
                    tier,
                    status: SubscriptionStatus::Active,
                    current_period_end: Some(period_end),
                    payment_method: PaymentMethod::Crypto,
                    stripe_customer_id: None,
                    stripe_subscription_id: None,
                })
                .await
            }
            IpnChange::Ignored(reason) => Ok(WebhookOutcome::ignored(reason)),
        }
    }

    async fn find_stripe_owner(
        &self,
        subscription_id: Option<&str>,
        user_sub: Option<&str>,
        customer_id: Option<&str>,
    ) -> Result<Option<Subscription>, AppError> {
        if let Some(id) = subscription_id {
            if let Some(found) = self.store.find_by_stripe_subscription(id).await? {
                return Ok(Some(found));
            }
        }
        if let Some(sub) = user_sub {
            if let Some(found) = self.store.get(sub).await? {
                return Ok(Some(found));
            }
        }
        if let Some(id) = customer_id {
            return self.store.find_by_stripe_customer(id).await;
        }
        Ok(None)
    }

    /// Database first, identity provider second. A failed mirror is logged and
    /// never fails the webhook, since the database already holds the truth.
    async fn commit(&self, update: SubscriptionUpdate) -> Result<WebhookOutcome, AppError> {
        let subscription = self.store.upsert(&update).await?;
        info!(
            user = %subscription.user_sub,
            tier = %subscription.tier,
            status = %subscription.status,
            method = subscription.payment_method.map(|m| m.as_str()).unwrap_or("-"),
            "Subscription updated"
        );

        if let Err(e) = self
            .identity
            .sync_plan(&subscription.user_sub, subscription.tier)
            .await
        {
            warn!(user = %subscription.user_sub, "Identity provider sync failed: {e}");
        }

        Ok(WebhookOutcome::Updated {
            user_sub: subscription.user_sub,
            tier: subscription.tier,
            status: subscription.status,
        })
    }
}
