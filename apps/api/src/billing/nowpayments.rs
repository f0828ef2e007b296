//! NOWPayments crypto billing: IPN verification and invoice creation.
//!
//! IPN bodies are signed with HMAC-SHA512 over the JSON body re-serialised
//! with its keys sorted, hex-encoded in the `x-nowpayments-sig` header.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::Sha512;

use crate::billing::SignatureError;
use crate::config::{NowPaymentsConfig, TierPrices};
use crate::entitlements::tiers::Tier;
use crate::errors::AppError;

type HmacSha512 = Hmac<Sha512>;

pub const SIGNATURE_HEADER: &str = "x-nowpayments-sig";
/// Crypto payments buy a fixed prepaid period.
pub const PREPAID_PERIOD_DAYS: i64 = 30;
/// Exchange-rate slippage tolerated when matching a paid amount to a price.
const AMOUNT_TOLERANCE_USD: f64 = 0.01;

/// Rebuilds a JSON value with every object's keys in lexicographic order.
pub fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

fn mac_for(body: &Value, secret: &str) -> HmacSha512 {
    let mut mac =
        HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(sort_keys(body).to_string().as_bytes());
    mac
}

#[cfg(test)]
pub fn sign_ipn(body: &Value, secret: &str) -> String {
    hex::encode(mac_for(body, secret).finalize().into_bytes())
}

/// Verifies an IPN body and returns the parsed payment.
pub fn verify_ipn(body: &[u8], signature: &str, secret: &str) -> Result<IpnPayment, SignatureError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| SignatureError::Malformed)?;
    let expected = hex::decode(signature.trim()).map_err(|_| SignatureError::Mismatch)?;
    mac_for(&value, secret)
        .verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)?;
    serde_json::from_value(value).map_err(|_| SignatureError::Malformed)
}

// ────────────────────────────────────────────────────────────────────────────
// Payments
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Paid,
    Pending,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpnPayment {
    pub payment_id: Value,
    pub payment_status: String,
    #[serde(deserialize_with = "amount")]
    pub price_amount: f64,
    #[serde(default)]
    pub price_currency: Option<String>,
    /// We set this to the buyer's user subject when creating the invoice.
    #[serde(default)]
    pub order_id: Option<String>,
}

impl IpnPayment {
    pub fn state(&self) -> PaymentState {
        match self.payment_status.as_str() {
            "finished" | "confirmed" => PaymentState::Paid,
            "failed" | "refunded" | "expired" => PaymentState::Failed,
            // waiting, confirming, sending, partially_paid
            _ => PaymentState::Pending,
        }
    }
}

/// Accepts amounts sent either as JSON numbers or numeric strings.
fn amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("amount out of range")),
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!("invalid amount {other}"))),
    }
}

/// The highest tier whose monthly price the payment covers.
pub fn tier_for_amount(prices: &TierPrices, amount_usd: f64) -> Option<Tier> {
    [Tier::Enterprise, Tier::Professional, Tier::Starter]
        .into_iter()
        .find(|t| {
            prices
                .price_of(*t)
                .map(|price| amount_usd + AMOUNT_TOLERANCE_USD >= price)
                .unwrap_or(false)
        })
}

/// What an IPN means for our subscription table.
#[derive(Debug, Clone, PartialEq)]
pub enum IpnChange {
    Activate {
        user_sub: String,
        tier: Tier,
        period_end: DateTime<Utc>,
    },
    Ignored(String),
}

pub fn interpret(
    payment: &IpnPayment,
    prices: &TierPrices,
    now: DateTime<Utc>,
) -> Result<IpnChange, AppError> {
    match payment.state() {
        PaymentState::Pending | PaymentState::Failed => {
            return Ok(IpnChange::Ignored(format!(
                "payment {} is {}",
                payment.payment_id, payment.payment_status
            )));
        }
        PaymentState::Paid => {}
    }

    if let Some(currency) = &payment.price_currency {
        if !currency.eq_ignore_ascii_case("usd") {
            return Err(AppError::Validation(format!(
                "Unsupported price currency '{currency}'"
            )));
        }
    }

    let user_sub = payment
        .order_id
        .clone()
        .filter(|o| !o.trim().is_empty())
        .ok_or_else(|| AppError::Validation("Payment has no order reference".to_string()))?;

    let tier = tier_for_amount(prices, payment.price_amount).ok_or_else(|| {
        AppError::Validation(format!(
            "Amount {:.2} does not cover any plan",
            payment.price_amount
        ))
    })?;

    Ok(IpnChange::Activate {
        user_sub,
        tier,
        period_end: now + chrono::Duration::days(PREPAID_PERIOD_DAYS),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Outbound API
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InvoiceRequest<'a> {
    price_amount: f64,
    price_currency: &'a str,
    order_id: &'a str,
    order_description: String,
    ipn_callback_url: &'a str,
    success_url: &'a str,
    cancel_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    invoice_url: String,
}

#[derive(Clone)]
pub struct NowPaymentsClient {
    client: Client,
    config: NowPaymentsConfig,
}

/// URLs a crypto invoice redirects to and reports back on.
pub struct InvoiceUrls<'a> {
    pub ipn_callback: &'a str,
    pub success: &'a str,
    pub cancel: &'a str,
}

impl NowPaymentsClient {
    pub fn new(config: NowPaymentsConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_default(),
            config,
        }
    }

    pub fn config(&self) -> &NowPaymentsConfig {
        &self.config
    }

    /// Creates a hosted invoice for one prepaid period and returns its URL.
    pub async fn create_invoice(
        &self,
        user_sub: &str,
        tier: Tier,
        amount_usd: f64,
        urls: InvoiceUrls<'_>,
    ) -> Result<String, AppError> {
        let request = InvoiceRequest {
            price_amount: amount_usd,
            price_currency: "usd",
            order_id: user_sub,
            order_description: format!("Obscura {tier} plan ({PREPAID_PERIOD_DAYS} days)"),
            ipn_callback_url: urls.ipn_callback,
            success_url: urls.success,
            cancel_url: urls.cancel,
        };

        let url = format!("{}/v1/invoice", self.config.api_base.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("NOWPayments request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "NOWPayments returned {status}: {body}"
            )));
        }

        let invoice: InvoiceResponse = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("Unexpected NOWPayments response: {e}")))?;
        Ok(invoice.invoice_url)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub const IPN_SECRET: &str = "ipn-secret";

    fn paid(amount: Value) -> Value {
        json!({
            "payment_id": 5077125051u64,
            "payment_status": "finished",
            "pay_address": "0xabc",
            "price_amount": amount,
            "price_currency": "usd",
            "order_id": "auth0|crypto",
        })
    }

    #[test]
    fn test_sort_keys_is_recursive() {
        let v = json!({"b": 1, "a": {"d": [ {"z": 1, "y": 2} ], "c": 3}});
        assert_eq!(
            sort_keys(&v).to_string(),
            r#"{"a":{"c":3,"d":[{"y":2,"z":1}]},"b":1}"#
        );
    }

    #[test]
    fn test_signature_is_independent_of_key_order() {
        let body = br#"{"payment_status":"finished","payment_id":1,"price_amount":29,"order_id":"u"}"#;
        let sig = sign_ipn(&serde_json::from_slice(body).unwrap(), IPN_SECRET);
        let payment = verify_ipn(body, &sig, IPN_SECRET).unwrap();
        assert_eq!(payment.state(), PaymentState::Paid);
        assert_eq!(payment.order_id.as_deref(), Some("u"));
    }

    #[test]
    fn test_tampered_ipn_rejected() {
        let body = paid(json!(29));
        let sig = sign_ipn(&body, IPN_SECRET);
        let mut tampered = body.clone();
        tampered["price_amount"] = json!(499);
        let bytes = serde_json::to_vec(&tampered).unwrap();
        assert_eq!(
            verify_ipn(&bytes, &sig, IPN_SECRET).err(),
            Some(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_ipn(&bytes, "not-hex", IPN_SECRET).err(),
            Some(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_ipn(b"not json", &sig, IPN_SECRET).err(),
            Some(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_amount_to_tier() {
        let prices = TierPrices::default();
        assert_eq!(tier_for_amount(&prices, 28.0), None);
        assert_eq!(tier_for_amount(&prices, 28.995), Some(Tier::Starter));
        assert_eq!(tier_for_amount(&prices, 99.0), Some(Tier::Professional));
        assert_eq!(tier_for_amount(&prices, 250.0), Some(Tier::Professional));
        assert_eq!(tier_for_amount(&prices, 1000.0), Some(Tier::Enterprise));
    }

    #[test]
    fn test_paid_ipn_activates_for_prepaid_period() {
        let payment: IpnPayment = serde_json::from_value(paid(json!("99.00"))).unwrap();
        let now = Utc::now();
        assert_eq!(
            interpret(&payment, &TierPrices::default(), now).unwrap(),
            IpnChange::Activate {
                user_sub: "auth0|crypto".into(),
                tier: Tier::Professional,
                period_end: now + chrono::Duration::days(30),
            }
        );
    }

    #[test]
    fn test_pending_and_failed_ignored() {
        for status in ["waiting", "partially_paid", "expired", "refunded"] {
            let mut body = paid(json!(29));
            body["payment_status"] = json!(status);
            let payment: IpnPayment = serde_json::from_value(body).unwrap();
            assert!(matches!(
                interpret(&payment, &TierPrices::default(), Utc::now()).unwrap(),
                IpnChange::Ignored(_)
            ));
        }
    }

    #[test]
    fn test_underpayment_rejected() {
        let payment: IpnPayment = serde_json::from_value(paid(json!(5))).unwrap();
        assert!(matches!(
            interpret(&payment, &TierPrices::default(), Utc::now()),
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_invoice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/invoice"))
            .and(header("x-api-key", "np_key"))
            .and(body_partial_json(json!({"order_id": "auth0|u", "price_currency": "usd"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "4522625843",
                "invoice_url": "https://nowpayments.io/payment/?iid=4522625843"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = NowPaymentsClient::new(NowPaymentsConfig {
            api_key: "np_key".into(),
            ipn_secret: IPN_SECRET.into(),
            api_base: server.uri(),
        });
        let url = client
            .create_invoice(
                "auth0|u",
                Tier::Starter,
                29.0,
                InvoiceUrls {
                    ipn_callback: "https://api/ipn",
                    success: "https://app/ok",
                    cancel: "https://app/cancel",
                },
            )
            .await
            .unwrap();
        assert_eq!(url, "https://nowpayments.io/payment/?iid=4522625843");
    }
}
