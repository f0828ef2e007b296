//! Stripe: webhook verification through the SDK, event interpretation, and the
//! two outbound calls the dashboard needs (checkout and billing portal).

use std::collections::HashMap;

use ::stripe::{
    BillingPortalSession, CheckoutSession, CheckoutSessionMode, Client, CreateBillingPortalSession,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData,
    CustomerId, Event, EventObject, EventType, Invoice, Subscription, Webhook, WebhookError,
};
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, error, info};

use crate::billing::SignatureError;
use crate::config::StripeConfig;
use crate::entitlements::tiers::Tier;
use crate::errors::AppError;
use crate::subscriptions::SubscriptionStatus;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Checks the `Stripe-Signature` header and parses the event.
///
/// The SDK rejects signatures older than five minutes.
pub fn verify_event(payload: &str, signature: &str, secret: &str) -> Result<Event, AppError> {
    Webhook::construct_event(payload, signature, secret).map_err(|e| match e {
        WebhookError::BadHeader(_) => SignatureError::Malformed.into(),
        WebhookError::BadTimestamp(_) => SignatureError::Expired.into(),
        WebhookError::BadParse(e) => {
            AppError::Validation(format!("Unrecognised Stripe event payload: {e}"))
        }
        _ => SignatureError::Mismatch.into(),
    })
}

/// What a Stripe event means for our subscription table.
#[derive(Debug, Clone, PartialEq)]
pub enum StripeChange {
    CheckoutCompleted {
        user_sub: String,
        tier: Tier,
        customer_id: Option<String>,
        subscription_id: Option<String>,
    },
    SubscriptionChanged {
        subscription_id: String,
        customer_id: Option<String>,
        user_sub: Option<String>,
        /// `None` when the price is not one of ours.
        tier: Option<Tier>,
        status: SubscriptionStatus,
        current_period_end: Option<DateTime<Utc>>,
    },
    PaymentFailed {
        subscription_id: Option<String>,
        customer_id: Option<String>,
    },
    Ignored(String),
}

/// Maps Stripe's subscription statuses onto ours.
pub fn map_status(stripe_status: &str) -> SubscriptionStatus {
    match stripe_status {
        "active" | "trialing" => SubscriptionStatus::Active,
        "past_due" | "unpaid" => SubscriptionStatus::PastDue,
        _ => SubscriptionStatus::Cancelled,
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

pub fn interpret(event: &Event, config: &StripeConfig) -> Result<StripeChange, AppError> {
    match (&event.type_, &event.data.object) {
        (EventType::CheckoutSessionCompleted, EventObject::CheckoutSession(session)) => {
            from_checkout(session, config)
        }
        (
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated,
            EventObject::Subscription(sub),
        ) => Ok(from_subscription(sub, false, config)),
        (EventType::CustomerSubscriptionDeleted, EventObject::Subscription(sub)) => {
            Ok(from_subscription(sub, true, config))
        }
        (EventType::InvoicePaymentFailed, EventObject::Invoice(invoice)) => {
            Ok(from_failed_invoice(invoice))
        }
        (other, _) => {
            let event_type = format!("{other:?}");
            debug!(%event_type, "Ignoring Stripe event");
            Ok(StripeChange::Ignored(event_type))
        }
    }
}

fn from_checkout(
    session: &CheckoutSession,
    config: &StripeConfig,
) -> Result<StripeChange, AppError> {
    if session.mode != CheckoutSessionMode::Subscription {
        return Ok(StripeChange::Ignored("non-subscription checkout".to_string()));
    }
    let metadata = session.metadata.clone().unwrap_or_default();

    let user_sub = session
        .client_reference_id
        .clone()
        .or_else(|| metadata.get("user_sub").cloned())
        .ok_or_else(|| AppError::Validation("Checkout session has no user reference".to_string()))?;
    let tier = metadata
        .get("price_id")
        .and_then(|p| config.tier_for_price(p))
        .or_else(|| metadata.get("tier").and_then(|t| t.parse().ok()))
        .ok_or_else(|| AppError::Validation("Checkout session has no known price".to_string()))?;

    Ok(StripeChange::CheckoutCompleted {
        user_sub,
        tier,
        customer_id: session.customer.as_ref().map(|c| c.id().to_string()),
        subscription_id: session.subscription.as_ref().map(|s| s.id().to_string()),
    })
}

fn from_subscription(sub: &Subscription, deleted: bool, config: &StripeConfig) -> StripeChange {
    let tier = sub
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref().and_then(|price| config.tier_for_price(price.id.as_str())));

    let (status, period_end) = if deleted {
        let ended = sub.ended_at.and_then(timestamp).unwrap_or_else(Utc::now);
        (SubscriptionStatus::Cancelled, Some(ended))
    } else {
        (
            map_status(sub.status.as_str()),
            timestamp(sub.current_period_end),
        )
    };

    StripeChange::SubscriptionChanged {
        subscription_id: sub.id.to_string(),
        customer_id: Some(sub.customer.id().to_string()),
        user_sub: sub.metadata.get("user_sub").cloned(),
        tier,
        status,
        current_period_end: period_end,
    }
}

fn from_failed_invoice(invoice: &Invoice) -> StripeChange {
    StripeChange::PaymentFailed {
        subscription_id: invoice.subscription.as_ref().map(|s| s.id().to_string()),
        customer_id: invoice.customer.as_ref().map(|c| c.id().to_string()),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Outbound API
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct StripeClient {
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn client(&self) -> Client {
        Client::new(&self.config.secret_key)
    }

    /// Creates a subscription checkout session and returns its hosted URL.
    pub async fn create_checkout_session(
        &self,
        user_sub: &str,
        email: Option<&str>,
        tier: Tier,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<String, AppError> {
        let price_id = self
            .config
            .price_for(tier)
            .ok_or_else(|| AppError::Validation(format!("The {tier} plan cannot be purchased")))?;

        let metadata = HashMap::from([
            ("user_sub".to_string(), user_sub.to_string()),
            ("price_id".to_string(), price_id.to_string()),
        ]);
        let params = CreateCheckoutSession {
            cancel_url: Some(cancel_url),
            success_url: Some(success_url),
            client_reference_id: Some(user_sub),
            customer_email: email,
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(price_id.to_string()),
                quantity: Some(1),
                ..Default::default()
            }]),
            metadata: Some(metadata),
            mode: Some(CheckoutSessionMode::Subscription),
            subscription_data: Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(HashMap::from([(
                    "user_sub".to_string(),
                    user_sub.to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let session = CheckoutSession::create(&self.client(), params)
            .await
            .map_err(|e| {
                error!("Failed to create Stripe checkout session: {e:?}");
                AppError::Upstream(format!("Stripe checkout failed: {e}"))
            })?;
        info!(session = %session.id, user = user_sub, "Stripe checkout session created");

        session
            .url
            .ok_or_else(|| AppError::Upstream("Stripe checkout session has no URL".to_string()))
    }

    /// Opens the self-service billing portal for an existing customer.
    pub async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String, AppError> {
        let customer: CustomerId = customer_id
            .parse()
            .map_err(|_| {
                AppError::Internal(anyhow::anyhow!(
                    "Stored Stripe customer id {customer_id} is invalid"
                ))
            })?;

        let mut params = CreateBillingPortalSession::new(customer);
        params.return_url = Some(return_url);

        let session = BillingPortalSession::create(&self.client(), params)
            .await
            .map_err(|e| {
                error!("Failed to create Stripe billing portal session: {e:?}");
                AppError::Upstream(format!("Stripe portal failed: {e}"))
            })?;
        Ok(session.url)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ::stripe::{Expandable, List, Price, SubscriptionItem};
    use hmac::{Hmac, Mac};
    use serde_json::json;
    use sha2::Sha256;

    pub const SECRET: &str = "whsec_test123secret456";

    pub fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_xxx".into(),
            webhook_secret: SECRET.into(),
            price_starter: "price_starter".into(),
            price_professional: "price_pro".into(),
            price_enterprise: "price_ent".into(),
        }
    }

    /// Signs `payload` the way Stripe does: HMAC-SHA256 over `"{t}.{payload}"`.
    pub fn signed_header(payload: &str, timestamp: i64, secret: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    /// Wraps an SDK object in a full event envelope.
    pub fn event_json(event_type: &str, object: EventObject) -> String {
        json!({
            "id": "evt_test_1",
            "object": "event",
            "created": 1_700_000_000,
            "livemode": false,
            "pending_webhooks": 1,
            "type": event_type,
            "data": { "object": serde_json::to_value(object).unwrap() }
        })
        .to_string()
    }

    pub fn checkout_session(user: &str, price_id: &str) -> CheckoutSession {
        CheckoutSession {
            id: "cs_test_1".parse().unwrap(),
            mode: CheckoutSessionMode::Subscription,
            client_reference_id: Some(user.to_string()),
            customer: Some(Expandable::Id("cus_42".parse().unwrap())),
            subscription: Some(Expandable::Id("sub_42".parse().unwrap())),
            metadata: Some(HashMap::from([(
                "price_id".to_string(),
                price_id.to_string(),
            )])),
            ..Default::default()
        }
    }

    fn subscription(id: &str, price_id: &str, status: ::stripe::SubscriptionStatus) -> Subscription {
        Subscription {
            id: id.parse().unwrap(),
            customer: Expandable::Id("cus_1".parse().unwrap()),
            status,
            current_period_end: 1_900_000_000,
            items: List {
                data: vec![SubscriptionItem {
                    price: Some(Price {
                        id: price_id.parse().unwrap(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn expect_err(result: Result<Event, AppError>) -> AppError {
        match result {
            Ok(event) => panic!("unexpectedly verified {:?}", event.type_),
            Err(e) => e,
        }
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = event_json(
            "checkout.session.completed",
            EventObject::CheckoutSession(checkout_session("auth0|u1", "price_pro")),
        );
        let header = signed_header(&payload, Utc::now().timestamp(), SECRET);
        let event = verify_event(&payload, &header, SECRET).unwrap();
        assert!(matches!(event.type_, EventType::CheckoutSessionCompleted));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let original = r#"{"type":"checkout.session.completed"}"#;
        let tampered = r#"{"type":"checkout.session.completed","x":1}"#;
        let header = signed_header(original, Utc::now().timestamp(), SECRET);
        assert!(matches!(
            expect_err(verify_event(tampered, &header, SECRET)),
            AppError::InvalidSignature
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = "{}";
        let header = signed_header(payload, Utc::now().timestamp(), "whsec_wrong");
        assert!(matches!(
            expect_err(verify_event(payload, &header, SECRET)),
            AppError::InvalidSignature
        ));
    }

    #[test]
    fn test_old_timestamp_rejected() {
        let payload = "{}";
        let header = signed_header(payload, Utc::now().timestamp() - 600, SECRET);
        assert!(matches!(
            expect_err(verify_event(payload, &header, SECRET)),
            AppError::InvalidSignature
        ));
    }

    #[test]
    fn test_unparseable_timestamp_is_malformed() {
        assert!(matches!(
            expect_err(verify_event("{}", "t=yesterday,v1=abcd", SECRET)),
            AppError::Validation(_)
        ));
    }

    #[test]
    fn test_checkout_completed_maps_price_to_tier() {
        let session = checkout_session("auth0|u1", "price_pro");
        assert_eq!(
            from_checkout(&session, &test_config()).unwrap(),
            StripeChange::CheckoutCompleted {
                user_sub: "auth0|u1".into(),
                tier: Tier::Professional,
                customer_id: Some("cus_42".into()),
                subscription_id: Some("sub_42".into()),
            }
        );
    }

    #[test]
    fn test_checkout_without_user_is_rejected() {
        let session = CheckoutSession {
            client_reference_id: None,
            ..checkout_session("unused", "price_pro")
        };
        assert!(matches!(
            from_checkout(&session, &test_config()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_one_off_checkout_is_ignored() {
        let session = CheckoutSession {
            mode: CheckoutSessionMode::Payment,
            ..checkout_session("auth0|u1", "price_pro")
        };
        assert!(matches!(
            from_checkout(&session, &test_config()).unwrap(),
            StripeChange::Ignored(_)
        ));
    }

    #[test]
    fn test_subscription_updated_maps_price_and_status() {
        let sub = subscription("sub_1", "price_starter", ::stripe::SubscriptionStatus::PastDue);
        match from_subscription(&sub, false, &test_config()) {
            StripeChange::SubscriptionChanged {
                subscription_id,
                customer_id,
                tier,
                status,
                current_period_end,
                ..
            } => {
                assert_eq!(subscription_id, "sub_1");
                assert_eq!(customer_id.as_deref(), Some("cus_1"));
                assert_eq!(tier, Some(Tier::Starter));
                assert_eq!(status, SubscriptionStatus::PastDue);
                assert_eq!(current_period_end, timestamp(1_900_000_000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_subscription_deleted_is_cancelled() {
        let sub = Subscription {
            ended_at: Some(1_800_000_000),
            ..subscription("sub_1", "price_starter", ::stripe::SubscriptionStatus::Canceled)
        };
        match from_subscription(&sub, true, &test_config()) {
            StripeChange::SubscriptionChanged {
                status,
                current_period_end,
                ..
            } => {
                assert_eq!(status, SubscriptionStatus::Cancelled);
                assert_eq!(current_period_end, timestamp(1_800_000_000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_price_has_no_tier() {
        let sub = subscription("sub_1", "price_other", ::stripe::SubscriptionStatus::Active);
        assert!(matches!(
            from_subscription(&sub, false, &test_config()),
            StripeChange::SubscriptionChanged { tier: None, .. }
        ));
    }

    #[test]
    fn test_failed_invoice_carries_subscription() {
        let invoice = Invoice {
            subscription: Some(Expandable::Id("sub_9".parse().unwrap())),
            customer: Some(Expandable::Id("cus_9".parse().unwrap())),
            ..Default::default()
        };
        assert_eq!(
            from_failed_invoice(&invoice),
            StripeChange::PaymentFailed {
                subscription_id: Some("sub_9".into()),
                customer_id: Some("cus_9".into()),
            }
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status("trialing"), SubscriptionStatus::Active);
        assert_eq!(map_status("unpaid"), SubscriptionStatus::PastDue);
        assert_eq!(map_status("incomplete_expired"), SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_checkout_for_free_tier_never_calls_stripe() {
        let err = StripeClient::new(test_config())
            .create_checkout_session("auth0|u1", None, Tier::Free, "https://app/ok", "https://app/no")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
