//! Feature guard: the entitlement check every gated handler runs first.
//!
//! ```ignore
//! let grant = state
//!     .guard()
//!     .check(&user, &[Requirement::Feature(Feature::Monitoring)])
//!     .await?;
//! // ... do the work ...
//! grant.record(Limit::LookupsPerDay, 1).await?;
//! ```
//!
//! Usage is only recorded after the handler's work succeeded, so failed
//! requests never consume quota.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::auth::CurrentUser;
use crate::entitlements::tiers::{Feature, Limit, Tier};
use crate::entitlements::usage::{period_start, UsageStore};
use crate::errors::AppError;
use crate::subscriptions::{ResolvedTier, TierResolver};

/// A single precondition on the caller's entitlements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Feature(Feature),
    /// A time-windowed counter: rejects when `used + amount > limit`.
    Metered { limit: Limit, amount: u64 },
    /// A capacity checked against a live count supplied by the caller.
    Capacity {
        limit: Limit,
        current: u64,
        requested: u64,
    },
}

impl Requirement {
    pub fn metered(limit: Limit) -> Self {
        Requirement::Metered { limit, amount: 1 }
    }
}

#[derive(Clone)]
pub struct Guard {
    resolver: TierResolver,
    usage: Arc<dyn UsageStore>,
}

impl Guard {
    pub fn new(resolver: TierResolver, usage: Arc<dyn UsageStore>) -> Self {
        Self { resolver, usage }
    }

    /// Resolves the caller's tier and checks every requirement in order.
    /// The first unmet requirement decides the rejection.
    pub async fn check(
        &self,
        user: &CurrentUser,
        requirements: &[Requirement],
    ) -> Result<Grant, AppError> {
        let resolved = self.resolver.resolve(user).await?;
        let tier = resolved.tier;

        for requirement in requirements {
            match *requirement {
                Requirement::Feature(feature) => {
                    if !tier.has_feature(feature) {
                        debug!(user = %user.sub, %tier, %feature, "Feature not included");
                        return Err(AppError::FeatureNotIncluded { feature, tier });
                    }
                }
                Requirement::Metered { limit, amount } => {
                    let Some(max) = tier.limit(limit) else {
                        continue;
                    };
                    let used = match period_start(limit, Utc::now()) {
                        Some(period) => self.usage.current(&user.sub, limit, period).await?,
                        None => 0,
                    };
                    enforce(limit, max, used, amount)?;
                }
                Requirement::Capacity {
                    limit,
                    current,
                    requested,
                } => {
                    if let Some(max) = tier.limit(limit) {
                        enforce(limit, max, current, requested)?;
                    }
                }
            }
        }

        Ok(Grant {
            user_sub: user.sub.clone(),
            resolved,
            usage: self.usage.clone(),
        })
    }
}

/// Rejects when taking `requested` more would exceed `max`.
pub fn enforce(limit: Limit, max: u64, used: u64, requested: u64) -> Result<(), AppError> {
    if used.saturating_add(requested) > max {
        return Err(AppError::UsageLimitExceeded { limit, used, max });
    }
    Ok(())
}

/// Proof that the caller passed the guard; carries the resolved tier.
pub struct Grant {
    user_sub: String,
    resolved: ResolvedTier,
    usage: Arc<dyn UsageStore>,
}

impl Grant {
    pub fn tier(&self) -> Tier {
        self.resolved.tier
    }

    /// Increments a metered counter. Capacities are not recorded here.
    pub async fn record(&self, limit: Limit, amount: u64) -> Result<(), AppError> {
        if amount == 0 {
            return Ok(());
        }
        if let Some(period) = period_start(limit, Utc::now()) {
            let total = self
                .usage
                .increment(&self.user_sub, limit, period, amount)
                .await?;
            debug!(user = %self.user_sub, %limit, total, "Usage recorded");
        }
        Ok(())
    }
}
