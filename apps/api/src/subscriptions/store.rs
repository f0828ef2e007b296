#[cfg(test)]
use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use chrono::Utc;
use sqlx::PgPool;
#[cfg(test)]
use tokio::sync::RwLock;

use crate::errors::AppError;
use crate::subscriptions::{Subscription, SubscriptionRow, SubscriptionUpdate};

/// Persistence for users and their subscriptions.
///
/// Carried in `AppState` as `Arc<dyn SubscriptionStore>`.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Records a user on first sight and refreshes their email afterwards.
    async fn upsert_user(&self, user_sub: &str, email: Option<&str>) -> Result<(), AppError>;

    async fn user_email(&self, user_sub: &str) -> Result<Option<String>, AppError>;

    async fn get(&self, user_sub: &str) -> Result<Option<Subscription>, AppError>;

    async fn find_by_stripe_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError>;

    async fn find_by_stripe_customer(
        &self,
        stripe_customer_id: &str,
    ) -> Result<Option<Subscription>, AppError>;

    /// Insert-or-update keyed on `user_sub`. Replaying the same update is a no-op.
    async fn upsert(&self, update: &SubscriptionUpdate) -> Result<Subscription, AppError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Postgres
// ────────────────────────────────────────────────────────────────────────────

pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<Subscription>, AppError> {
        // `column` is always one of the fixed identifiers below, never user input.
        let sql = format!(
            "SELECT user_sub, tier, status, current_period_end, payment_method, \
             stripe_customer_id, stripe_subscription_id, updated_at \
             FROM subscriptions WHERE {column} = $1"
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Subscription::try_from)
            .transpose()
            .map_err(AppError::Internal)
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn upsert_user(&self, user_sub: &str, email: Option<&str>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO users (sub, email)
            VALUES ($1, $2)
            ON CONFLICT (sub) DO UPDATE
                SET email = COALESCE(EXCLUDED.email, users.email),
                    last_seen_at = now()
            "#,
        )
        .bind(user_sub)
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn user_email(&self, user_sub: &str) -> Result<Option<String>, AppError> {
        let email: Option<Option<String>> =
            sqlx::query_scalar("SELECT email FROM users WHERE sub = $1")
                .bind(user_sub)
                .fetch_optional(&self.pool)
                .await?;
        Ok(email.flatten())
    }

    async fn get(&self, user_sub: &str) -> Result<Option<Subscription>, AppError> {
        self.fetch_one_where("user_sub", user_sub).await
    }

    async fn find_by_stripe_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        self.fetch_one_where("stripe_subscription_id", stripe_subscription_id)
            .await
    }

    async fn find_by_stripe_customer(
        &self,
        stripe_customer_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        self.fetch_one_where("stripe_customer_id", stripe_customer_id)
            .await
    }

    async fn upsert(&self, update: &SubscriptionUpdate) -> Result<Subscription, AppError> {
        // The user row may not exist yet when a webhook arrives before first login.
        self.upsert_user(&update.user_sub, None).await?;

        let row: SubscriptionRow = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (user_sub, tier, status, current_period_end, payment_method,
                 stripe_customer_id, stripe_subscription_id, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (user_sub) DO UPDATE SET
                tier = EXCLUDED.tier,
                status = EXCLUDED.status,
                current_period_end = EXCLUDED.current_period_end,
                payment_method = EXCLUDED.payment_method,
                stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, subscriptions.stripe_customer_id),
                stripe_subscription_id = COALESCE(EXCLUDED.stripe_subscription_id, subscriptions.stripe_subscription_id),
                updated_at = now()
            RETURNING user_sub, tier, status, current_period_end, payment_method,
                      stripe_customer_id, stripe_subscription_id, updated_at
            "#,
        )
        .bind(&update.user_sub)
        .bind(update.tier.as_str())
        .bind(update.status.as_str())
        .bind(update.current_period_end)
        .bind(update.payment_method.as_str())
        .bind(&update.stripe_customer_id)
        .bind(&update.stripe_subscription_id)
        .fetch_one(&self.pool)
        .await?;

        Subscription::try_from(row).map_err(AppError::Internal)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory (tests)
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    users: RwLock<HashMap<String, Option<String>>>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

#[cfg(test)]
impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn find(&self, pred: impl Fn(&Subscription) -> bool) -> Option<Subscription> {
        self.subscriptions
            .read()
            .await
            .values()
            .find(|s| pred(s))
            .cloned()
    }
}

#[cfg(test)]
#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn upsert_user(&self, user_sub: &str, email: Option<&str>) -> Result<(), AppError> {
        let mut users = self.users.write().await;
        let entry = users.entry(user_sub.to_string()).or_insert(None);
        if let Some(email) = email {
            *entry = Some(email.to_string());
        }
        Ok(())
    }

    async fn user_email(&self, user_sub: &str) -> Result<Option<String>, AppError> {
        Ok(self.users.read().await.get(user_sub).cloned().flatten())
    }

    async fn get(&self, user_sub: &str) -> Result<Option<Subscription>, AppError> {
        Ok(self.subscriptions.read().await.get(user_sub).cloned())
    }

    async fn find_by_stripe_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self
            .find(|s| s.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
            .await)
    }

    async fn find_by_stripe_customer(
        &self,
        stripe_customer_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self
            .find(|s| s.stripe_customer_id.as_deref() == Some(stripe_customer_id))
            .await)
    }

    async fn upsert(&self, update: &SubscriptionUpdate) -> Result<Subscription, AppError> {
        self.upsert_user(&update.user_sub, None).await?;

        let mut subs = self.subscriptions.write().await;
        let previous = subs.get(&update.user_sub);
        let subscription = Subscription {
            user_sub: update.user_sub.clone(),
            tier: update.tier,
            status: update.status,
            current_period_end: update.current_period_end,
            payment_method: Some(update.payment_method),
            stripe_customer_id: update
                .stripe_customer_id
                .clone()
                .or_else(|| previous.and_then(|p| p.stripe_customer_id.clone())),
            stripe_subscription_id: update
                .stripe_subscription_id
                .clone()
                .or_else(|| previous.and_then(|p| p.stripe_subscription_id.clone())),
            updated_at: Utc::now(),
        };
        subs.insert(update.user_sub.clone(), subscription.clone());
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::tiers::Tier;
    use crate::subscriptions::{PaymentMethod, SubscriptionStatus};

    fn update(tier: Tier, customer: Option<&str>) -> SubscriptionUpdate {
        SubscriptionUpdate {
            user_sub: "auth0|abc".into(),
            tier,
            status: SubscriptionStatus::Active,
            current_period_end: None,
            payment_method: PaymentMethod::Card,
            stripe_customer_id: customer.map(String::from),
            stripe_subscription_id: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_provider_ids() {
        let store = InMemorySubscriptionStore::new();
        store
            .upsert(&update(Tier::Starter, Some("cus_1")))
            .await
            .unwrap();
        let s = store.upsert(&update(Tier::Enterprise, None)).await.unwrap();
        assert_eq!(s.tier, Tier::Enterprise);
        assert_eq!(s.stripe_customer_id.as_deref(), Some("cus_1"));

        let found = store.find_by_stripe_customer("cus_1").await.unwrap();
        assert_eq!(found.map(|s| s.tier), Some(Tier::Enterprise));
    }

    #[tokio::test]
    async fn test_upsert_user_keeps_email_when_absent() {
        let store = InMemorySubscriptionStore::new();
        store
            .upsert_user("auth0|abc", Some("a@b.io"))
            .await
            .unwrap();
        store.upsert_user("auth0|abc", None).await.unwrap();
        assert_eq!(
            store.user_email("auth0|abc").await.unwrap().as_deref(),
            Some("a@b.io")
        );
    }
}
