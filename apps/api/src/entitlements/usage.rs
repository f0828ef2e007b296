//! Metered usage counters.
//!
//! Counters are keyed by `(user, metric, period_start)`. A new period simply
//! has no row yet, so resets happen implicitly at period boundaries:
//! lookups reset at 00:00 UTC each day, API credits on the 1st of each month.

#[cfg(test)]
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use sqlx::PgPool;
#[cfg(test)]
use tokio::sync::Mutex;

use crate::entitlements::tiers::Limit;
use crate::errors::AppError;

/// First day of the period `at` falls in for a metered limit.
///
/// Returns `None` for limits that are not metered over time (they are
/// capacities checked against a live count instead).
pub fn period_start(limit: Limit, at: DateTime<Utc>) -> Option<NaiveDate> {
    let day = at.date_naive();
    match limit {
        Limit::LookupsPerDay => Some(day),
        Limit::ApiCreditsPerMonth => day.with_day(1),
        Limit::MonitoringTargets | Limit::BulkBatchSize => None,
    }
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn current(
        &self,
        user_sub: &str,
        metric: Limit,
        period_start: NaiveDate,
    ) -> Result<u64, AppError>;

    /// Adds `amount` and returns the new total.
    async fn increment(
        &self,
        user_sub: &str,
        metric: Limit,
        period_start: NaiveDate,
        amount: u64,
    ) -> Result<u64, AppError>;
}

pub struct PgUsageStore {
    pool: PgPool,
}

impl PgUsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageStore for PgUsageStore {
    async fn current(
        &self,
        user_sub: &str,
        metric: Limit,
        period_start: NaiveDate,
    ) -> Result<u64, AppError> {
        let used: Option<i64> = sqlx::query_scalar(
            "SELECT used FROM usage_counters WHERE user_sub = $1 AND metric = $2 AND period_start = $3",
        )
        .bind(user_sub)
        .bind(metric.as_str())
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(used.unwrap_or(0).max(0) as u64)
    }

    async fn increment(
        &self,
        user_sub: &str,
        metric: Limit,
        period_start: NaiveDate,
        amount: u64,
    ) -> Result<u64, AppError> {
        let used: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO usage_counters (user_sub, metric, period_start, used)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_sub, metric, period_start)
                DO UPDATE SET used = usage_counters.used + EXCLUDED.used
            RETURNING used
            "#,
        )
        .bind(user_sub)
        .bind(metric.as_str())
        .bind(period_start)
        .bind(amount as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(used.max(0) as u64)
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct InMemoryUsageStore {
    counters: Mutex<HashMap<(String, Limit, NaiveDate), u64>>,
}

#[cfg(test)]
impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn current(
        &self,
        user_sub: &str,
        metric: Limit,
        period_start: NaiveDate,
    ) -> Result<u64, AppError> {
        let counters = self.counters.lock().await;
        Ok(counters
            .get(&(user_sub.to_string(), metric, period_start))
            .copied()
            .unwrap_or(0))
    }

    async fn increment(
        &self,
        user_sub: &str,
        metric: Limit,
        period_start: NaiveDate,
        amount: u64,
    ) -> Result<u64, AppError> {
        let mut counters = self.counters.lock().await;
        let used = counters
            .entry((user_sub.to_string(), metric, period_start))
            .or_insert(0);
        *used += amount;
        Ok(*used)
    }
}
