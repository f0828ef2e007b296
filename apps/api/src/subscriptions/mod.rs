//! Subscriptions: the authoritative record of a user's tier.
//!
//! The `subscriptions` table is the single source of truth. The identity
//! provider's `app_metadata.plan` is only a cache written after billing
//! webhooks update this table; it is never read for gating.

pub mod resolver;
pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::entitlements::tiers::Tier;

pub use resolver::{ResolvedTier, TierResolver, TierSource};
#[cfg(test)]
pub use store::InMemorySubscriptionStore;
pub use store::{PgSubscriptionStore, SubscriptionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "cancelled" | "canceled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(format!("unknown subscription status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Crypto,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Crypto => "crypto",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card" => Ok(PaymentMethod::Card),
            "crypto" => Ok(PaymentMethod::Crypto),
            other => Err(format!("unknown payment method '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub user_sub: String,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub payment_method: Option<PaymentMethod>,
    #[serde(skip_serializing)]
    pub stripe_customer_id: Option<String>,
    #[serde(skip_serializing)]
    pub stripe_subscription_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// The tier the user is entitled to at `now`.
    ///
    /// Active subscriptions always grant their tier. Past-due and cancelled
    /// subscriptions keep their tier until the paid period runs out.
    pub fn effective_tier(&self, now: DateTime<Utc>) -> Tier {
        match self.status {
            SubscriptionStatus::Active => match self.current_period_end {
                // Crypto plans are prepaid for a fixed period with no renewal.
                Some(end) if self.payment_method == Some(PaymentMethod::Crypto) && end <= now => {
                    Tier::Free
                }
                _ => self.tier,
            },
            SubscriptionStatus::PastDue | SubscriptionStatus::Cancelled => {
                match self.current_period_end {
                    Some(end) if end > now => self.tier,
                    _ => Tier::Free,
                }
            }
        }
    }
}

/// Raw `subscriptions` row.
#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRow {
    pub user_sub: String,
    pub tier: String,
    pub status: String,
    pub current_period_end: Option<DateTime<Utc>>,
    pub payment_method: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = anyhow::Error;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            tier: row.tier.parse::<Tier>().map_err(anyhow::Error::msg)?,
            status: row.status.parse::<SubscriptionStatus>().map_err(anyhow::Error::msg)?,
            payment_method: row
                .payment_method
                .as_deref()
                .map(str::parse::<PaymentMethod>)
                .transpose()
                .map_err(anyhow::Error::msg)?,
            user_sub: row.user_sub,
            current_period_end: row.current_period_end,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            updated_at: row.updated_at,
        })
    }
}

/// A write to a user's subscription. `None` provider IDs leave the stored
/// values in place.
#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub user_sub: String,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub payment_method: PaymentMethod,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sub(status: SubscriptionStatus, end: Option<DateTime<Utc>>) -> Subscription {
        Subscription {
            user_sub: "auth0|u1".into(),
            tier: Tier::Professional,
            status,
            current_period_end: end,
            payment_method: Some(PaymentMethod::Card),
            stripe_customer_id: None,
            stripe_subscription_id: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_active_grants_tier() {
        let now = Utc::now();
        assert_eq!(
            sub(SubscriptionStatus::Active, None).effective_tier(now),
            Tier::Professional
        );
        // Card renewals can lag the period end; only the status matters.
        assert_eq!(
            sub(SubscriptionStatus::Active, Some(now - Duration::days(1))).effective_tier(now),
            Tier::Professional
        );
    }

    #[test]
    fn test_cancelled_keeps_tier_until_period_end() {
        let now = Utc::now();
        let live = sub(SubscriptionStatus::Cancelled, Some(now + Duration::days(3)));
        let lapsed = sub(SubscriptionStatus::Cancelled, Some(now - Duration::seconds(1)));
        assert_eq!(live.effective_tier(now), Tier::Professional);
        assert_eq!(lapsed.effective_tier(now), Tier::Free);
        assert_eq!(
            sub(SubscriptionStatus::PastDue, None).effective_tier(now),
            Tier::Free
        );
    }

    #[test]
    fn test_expired_crypto_plan_falls_back_to_free() {
        let now = Utc::now();
        let mut s = sub(SubscriptionStatus::Active, Some(now - Duration::days(1)));
        s.payment_method = Some(PaymentMethod::Crypto);
        assert_eq!(s.effective_tier(now), Tier::Free);
    }

    #[test]
    fn test_row_conversion_rejects_unknown_tier() {
        let row = SubscriptionRow {
            user_sub: "u".into(),
            tier: "gold".into(),
            status: "active".into(),
            current_period_end: None,
            payment_method: None,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            updated_at: Utc::now(),
        };
        assert!(Subscription::try_from(row).is_err());
    }

    #[test]
    fn test_status_accepts_us_spelling() {
        assert_eq!(
            "canceled".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Cancelled
        );
    }
}
