use axum::{extract::State, Json};
use chrono::{DateTime, Duration, Months, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

use crate::auth::CurrentUser;
use crate::entitlements::tiers::{Entitlements, Limit, Tier};
use crate::entitlements::usage::period_start;
use crate::errors::AppError;
use crate::state::AppState;
use crate::subscriptions::{Subscription, TierSource};

#[derive(Debug, Serialize)]
pub struct UsageMeter {
    pub used: u64,
    /// `None` means unlimited.
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct AccountUsage {
    pub lookups_per_day: UsageMeter,
    pub api_credits_per_month: UsageMeter,
    pub monitoring_targets: UsageMeter,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub user: CurrentUser,
    pub tier: Tier,
    pub source: TierSource,
    pub subscription: Option<Subscription>,
    pub entitlements: Entitlements,
    pub usage: AccountUsage,
}

/// Start of the period after the one beginning on `start`.
fn next_reset(limit: Limit, start: NaiveDate) -> Option<DateTime<Utc>> {
    let next = match limit {
        Limit::LookupsPerDay => start.checked_add_signed(Duration::days(1))?,
        Limit::ApiCreditsPerMonth => start.checked_add_months(Months::new(1))?,
        Limit::MonitoringTargets | Limit::BulkBatchSize => return None,
    };
    Some(next.and_time(NaiveTime::MIN).and_utc())
}

async fn meter(
    state: &AppState,
    user_sub: &str,
    tier: Tier,
    limit: Limit,
) -> Result<UsageMeter, AppError> {
    let Some(start) = period_start(limit, Utc::now()) else {
        return Ok(UsageMeter {
            used: 0,
            limit: tier.limit(limit),
            resets_at: None,
        });
    };
    Ok(UsageMeter {
        used: state.usage.current(user_sub, limit, start).await?,
        limit: tier.limit(limit),
        resets_at: next_reset(limit, start),
    })
}

/// GET /api/account
///
/// The dashboard's first call after login, so it also records the user.
pub async fn handle_get_account(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<AccountResponse>, AppError> {
    state
        .subscriptions
        .upsert_user(&user.sub, user.email.as_deref())
        .await?;

    let resolved = state.tiers.resolve(&user).await?;
    let tier = resolved.tier;

    let usage = AccountUsage {
        lookups_per_day: meter(&state, &user.sub, tier, Limit::LookupsPerDay).await?,
        api_credits_per_month: meter(&state, &user.sub, tier, Limit::ApiCreditsPerMonth).await?,
        monitoring_targets: UsageMeter {
            used: state.monitoring.count(&user.sub).await?,
            limit: tier.limit(Limit::MonitoringTargets),
            resets_at: None,
        },
    };

    Ok(Json(AccountResponse {
        tier,
        source: resolved.source,
        subscription: resolved.subscription,
        entitlements: tier.entitlements(),
        usage,
        user,
    }))
}
