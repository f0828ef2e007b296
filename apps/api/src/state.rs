use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::auth::api_keys::ApiKeyStore;
use crate::auth::jwt::JwtVerifier;
use crate::billing::identity::IdentityDirectory;
use crate::billing::nowpayments::NowPaymentsClient;
use crate::billing::stripe::StripeClient;
use crate::billing::BillingService;
use crate::config::Config;
use crate::entitlements::usage::UsageStore;
use crate::entitlements::Guard;
use crate::monitoring::{MonitoringStore, Scanner};
use crate::rate_limit::{RateLimitConfig, RateLimitStore};
use crate::search::{BreachSource, SearchAggregator};
use crate::subscriptions::{SubscriptionStore, TierResolver};

/// Per-source deadline for a single breach lookup.
const SOURCE_TIMEOUT: Duration = Duration::from_secs(20);

/// Persistence backends. Postgres/Redis in production, in-memory in tests.
pub struct Stores {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub usage: Arc<dyn UsageStore>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub monitoring: Arc<dyn MonitoringStore>,
    pub rate_limiter: Arc<dyn RateLimitStore>,
}

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt: Arc<JwtVerifier>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub usage: Arc<dyn UsageStore>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub monitoring: Arc<dyn MonitoringStore>,
    pub rate_limiter: Arc<dyn RateLimitStore>,
    pub rate_limit: RateLimitConfig,
    pub search: SearchAggregator,
    pub tiers: TierResolver,
    pub billing: BillingService,
    /// `None` when card billing is not configured.
    pub stripe: Option<StripeClient>,
    /// `None` when crypto billing is not configured.
    pub nowpayments: Option<NowPaymentsClient>,
}

impl AppState {
    pub fn new(
        config: Config,
        stores: Stores,
        sources: Vec<Arc<dyn BreachSource>>,
        identity: Arc<dyn IdentityDirectory>,
    ) -> Result<Self> {
        let jwt = Arc::new(JwtVerifier::from_config(&config.auth)?);
        let tiers = TierResolver::new(
            stores.subscriptions.clone(),
            &config.personal_account_emails,
        );
        let billing = BillingService::new(stores.subscriptions.clone(), identity);

        Ok(Self {
            jwt,
            tiers,
            billing,
            subscriptions: stores.subscriptions,
            usage: stores.usage,
            api_keys: stores.api_keys,
            monitoring: stores.monitoring,
            rate_limiter: stores.rate_limiter,
            rate_limit: RateLimitConfig::per_minute(config.rate_limit_per_minute),
            search: SearchAggregator::new(sources, SOURCE_TIMEOUT),
            stripe: config.stripe.clone().map(StripeClient::new),
            nowpayments: config.nowpayments.clone().map(NowPaymentsClient::new),
            config,
        })
    }

    pub fn guard(&self) -> Guard {
        Guard::new(self.tiers.clone(), self.usage.clone())
    }

    pub fn scanner(&self) -> Scanner {
        Scanner::new(
            self.monitoring.clone(),
            self.search.clone(),
            self.tiers.clone(),
            Duration::from_secs(self.config.monitoring_scan_interval_secs),
        )
    }
}
