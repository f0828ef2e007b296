//! Tier table: the static mapping from subscription tier to feature flags
//! and usage limits. Every entitlement decision in the API reads from here.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Subscription tier, ordered from least to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    #[serde(alias = "pro")]
    Starter,
    Professional,
    Enterprise,
}

impl Tier {
    #[cfg(test)]
    pub const ALL: [Tier; 4] = [
        Tier::Free,
        Tier::Starter,
        Tier::Professional,
        Tier::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn is_paid(&self) -> bool {
        *self != Tier::Free
    }

    pub fn entitlements(&self) -> Entitlements {
        match self {
            Tier::Free => Entitlements {
                features: &[Feature::BasicSearch],
                lookups_per_day: Some(5),
                api_credits_per_month: Some(0),
                monitoring_targets: Some(0),
                bulk_batch_size: Some(0),
            },
            Tier::Starter => Entitlements {
                features: &[
                    Feature::BasicSearch,
                    Feature::UnredactedResults,
                    Feature::DomainSearch,
                    Feature::Monitoring,
                ],
                lookups_per_day: Some(100),
                api_credits_per_month: Some(0),
                monitoring_targets: Some(5),
                bulk_batch_size: Some(0),
            },
            Tier::Professional => Entitlements {
                features: &[
                    Feature::BasicSearch,
                    Feature::UnredactedResults,
                    Feature::DomainSearch,
                    Feature::Monitoring,
                    Feature::CookieLookup,
                    Feature::Export,
                    Feature::ApiAccess,
                ],
                lookups_per_day: Some(1_000),
                api_credits_per_month: Some(10_000),
                monitoring_targets: Some(50),
                bulk_batch_size: Some(0),
            },
            Tier::Enterprise => Entitlements {
                features: &Feature::ALL,
                lookups_per_day: None,
                api_credits_per_month: None,
                monitoring_targets: None,
                bulk_batch_size: Some(500),
            },
        }
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.entitlements().features.contains(&feature)
    }

    /// `None` means unlimited.
    pub fn limit(&self, limit: Limit) -> Option<u64> {
        let e = self.entitlements();
        match limit {
            Limit::LookupsPerDay => e.lookups_per_day,
            Limit::ApiCreditsPerMonth => e.api_credits_per_month,
            Limit::MonitoringTargets => e.monitoring_targets,
            Limit::BulkBatchSize => e.bulk_batch_size,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "starter" | "pro" => Ok(Tier::Starter),
            "professional" => Ok(Tier::Professional),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Boolean entitlements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    BasicSearch,
    UnredactedResults,
    DomainSearch,
    Monitoring,
    CookieLookup,
    Export,
    ApiAccess,
    BulkSearch,
}

impl Feature {
    pub const ALL: [Feature; 8] = [
        Feature::BasicSearch,
        Feature::UnredactedResults,
        Feature::DomainSearch,
        Feature::Monitoring,
        Feature::CookieLookup,
        Feature::Export,
        Feature::ApiAccess,
        Feature::BulkSearch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::BasicSearch => "basic_search",
            Feature::UnredactedResults => "unredacted_results",
            Feature::DomainSearch => "domain_search",
            Feature::Monitoring => "monitoring",
            Feature::CookieLookup => "cookie_lookup",
            Feature::Export => "export",
            Feature::ApiAccess => "api_access",
            Feature::BulkSearch => "bulk_search",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric entitlements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    LookupsPerDay,
    ApiCreditsPerMonth,
    MonitoringTargets,
    BulkBatchSize,
}

impl Limit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Limit::LookupsPerDay => "lookups_per_day",
            Limit::ApiCreditsPerMonth => "api_credits_per_month",
            Limit::MonitoringTargets => "monitoring_targets",
            Limit::BulkBatchSize => "bulk_batch_size",
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The row of the tier table for a single tier.
#[derive(Debug, Clone, Serialize)]
pub struct Entitlements {
    pub features: &'static [Feature],
    pub lookups_per_day: Option<u64>,
    pub api_credits_per_month: Option<u64>,
    pub monitoring_targets: Option<u64>,
    pub bulk_batch_size: Option<u64>,
}
