use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::auth::CurrentUser;
use crate::entitlements::tiers::Tier;
use crate::errors::AppError;
use crate::subscriptions::{Subscription, SubscriptionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierSource {
    /// Internal account configured to always receive the top tier.
    PersonalAccount,
    Subscription,
    /// No subscription row exists.
    Default,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedTier {
    pub tier: Tier,
    pub source: TierSource,
    pub subscription: Option<Subscription>,
}

/// Resolves the tier a caller is entitled to right now.
#[derive(Clone)]
pub struct TierResolver {
    store: Arc<dyn SubscriptionStore>,
    personal_accounts: Arc<HashSet<String>>,
}

impl TierResolver {
    pub fn new(store: Arc<dyn SubscriptionStore>, personal_account_emails: &[String]) -> Self {
        Self {
            store,
            personal_accounts: Arc::new(
                personal_account_emails
                    .iter()
                    .map(|e| e.to_ascii_lowercase())
                    .collect(),
            ),
        }
    }

    pub fn is_personal_account(&self, email: Option<&str>) -> bool {
        email
            .map(|e| self.personal_accounts.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    pub async fn resolve(&self, user: &CurrentUser) -> Result<ResolvedTier, AppError> {
        let resolved = self.resolve_for(&user.sub, user.email.as_deref()).await?;

        if let Some(claimed) = user.plan_claim {
            if claimed != resolved.tier {
                debug!(
                    user = %user.sub,
                    claimed = %claimed,
                    resolved = %resolved.tier,
                    "Identity provider plan claim is stale; using subscription record"
                );
            }
        }

        Ok(resolved)
    }

    /// Resolves a user who is not making the request, such as the owner of a
    /// monitoring target. Uses the last verified email seen for them.
    pub async fn resolve_owner(&self, user_sub: &str) -> Result<ResolvedTier, AppError> {
        let email = self.store.user_email(user_sub).await?;
        self.resolve_for(user_sub, email.as_deref()).await
    }

    async fn resolve_for(
        &self,
        user_sub: &str,
        email: Option<&str>,
    ) -> Result<ResolvedTier, AppError> {
        let subscription = self.store.get(user_sub).await?;

        Ok(if self.is_personal_account(email) {
            ResolvedTier {
                tier: Tier::Enterprise,
                source: TierSource::PersonalAccount,
                subscription,
            }
        } else {
            match subscription {
                Some(s) => ResolvedTier {
                    tier: s.effective_tier(Utc::now()),
                    source: TierSource::Subscription,
                    subscription: Some(s),
                },
                None => ResolvedTier {
                    tier: Tier::Free,
                    source: TierSource::Default,
                    subscription: None,
                },
            }
        })
    }
}
