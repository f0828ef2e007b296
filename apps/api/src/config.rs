use anyhow::{bail, Context, Result};

use crate::entitlements::tiers::Tier;

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    pub rust_log: String,
    pub public_app_url: String,
    pub auth: AuthConfig,
    /// Lower-cased emails that always resolve to the enterprise tier.
    pub personal_account_emails: Vec<String>,
    pub tier_prices: TierPrices,
    pub stripe: Option<StripeConfig>,
    pub nowpayments: Option<NowPaymentsConfig>,
    pub auth0_management: Option<Auth0ManagementConfig>,
    pub leakcheck_api_key: Option<String>,
    pub elasticsearch: Option<ElasticsearchConfig>,
    pub monitoring_scan_interval_secs: u64,
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HS256 shared secret. Used when no public key is configured.
    pub jwt_secret: Option<String>,
    /// RS256 public key (PEM) of the identity provider.
    pub jwt_public_key_pem: Option<String>,
    pub audience: Option<String>,
    pub issuer: Option<String>,
    /// Namespaced claim carrying the identity provider's cached plan.
    pub plan_claim: String,
}

/// Monthly list prices in USD, used for crypto invoices and IPN amount matching.
#[derive(Debug, Clone)]
pub struct TierPrices {
    pub starter: f64,
    pub professional: f64,
    pub enterprise: f64,
}

impl TierPrices {
    pub fn price_of(&self, tier: Tier) -> Option<f64> {
        match tier {
            Tier::Free => None,
            Tier::Starter => Some(self.starter),
            Tier::Professional => Some(self.professional),
            Tier::Enterprise => Some(self.enterprise),
        }
    }
}

impl Default for TierPrices {
    fn default() -> Self {
        Self {
            starter: 29.0,
            professional: 99.0,
            enterprise: 499.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_starter: String,
    pub price_professional: String,
    pub price_enterprise: String,
}

impl StripeConfig {
    pub fn price_for(&self, tier: Tier) -> Option<&str> {
        match tier {
            Tier::Free => None,
            Tier::Starter => Some(&self.price_starter),
            Tier::Professional => Some(&self.price_professional),
            Tier::Enterprise => Some(&self.price_enterprise),
        }
    }

    pub fn tier_for_price(&self, price_id: &str) -> Option<Tier> {
        [Tier::Starter, Tier::Professional, Tier::Enterprise]
            .into_iter()
            .find(|t| self.price_for(*t) == Some(price_id))
    }
}

#[derive(Debug, Clone)]
pub struct NowPaymentsConfig {
    pub api_key: String,
    pub ipn_secret: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct Auth0ManagementConfig {
    pub domain: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    pub url: String,
    pub index: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let auth = AuthConfig {
            jwt_secret: optional_env("AUTH_JWT_SECRET"),
            jwt_public_key_pem: optional_env("AUTH_JWT_PUBLIC_KEY_PEM"),
            audience: optional_env("AUTH_AUDIENCE"),
            issuer: optional_env("AUTH_ISSUER"),
            plan_claim: optional_env("AUTH_PLAN_CLAIM")
                .unwrap_or_else(|| "https://obscuralabs.io/plan".to_string()),
        };
        if auth.jwt_secret.is_none() && auth.jwt_public_key_pem.is_none() {
            bail!("One of AUTH_JWT_SECRET or AUTH_JWT_PUBLIC_KEY_PEM must be set");
        }

        let stripe = match optional_env("STRIPE_SECRET_KEY") {
            Some(secret_key) => Some(StripeConfig {
                secret_key,
                webhook_secret: require_env("STRIPE_WEBHOOK_SECRET")?,
                price_starter: require_env("STRIPE_PRICE_STARTER")?,
                price_professional: require_env("STRIPE_PRICE_PROFESSIONAL")?,
                price_enterprise: require_env("STRIPE_PRICE_ENTERPRISE")?,
            }),
            None => None,
        };

        let nowpayments = match optional_env("NOWPAYMENTS_API_KEY") {
            Some(api_key) => Some(NowPaymentsConfig {
                api_key,
                ipn_secret: require_env("NOWPAYMENTS_IPN_SECRET")?,
                api_base: optional_env("NOWPAYMENTS_API_BASE")
                    .unwrap_or_else(|| "https://api.nowpayments.io".to_string()),
            }),
            None => None,
        };

        let auth0_management = match optional_env("AUTH0_DOMAIN") {
            Some(domain) => Some(Auth0ManagementConfig {
                domain,
                client_id: require_env("AUTH0_MGMT_CLIENT_ID")?,
                client_secret: require_env("AUTH0_MGMT_CLIENT_SECRET")?,
            }),
            None => None,
        };

        let elasticsearch = optional_env("ELASTICSEARCH_URL").map(|url| ElasticsearchConfig {
            url,
            index: optional_env("ELASTICSEARCH_INDEX").unwrap_or_else(|| "breaches".to_string()),
        });

        let defaults = TierPrices::default();
        let tier_prices = TierPrices {
            starter: parse_env("PRICE_STARTER_USD", defaults.starter)?,
            professional: parse_env("PRICE_PROFESSIONAL_USD", defaults.professional)?,
            enterprise: parse_env("PRICE_ENTERPRISE_USD", defaults.enterprise)?,
        };

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            port: parse_env("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            public_app_url: optional_env("PUBLIC_APP_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            auth,
            personal_account_emails: parse_email_list(
                &std::env::var("PERSONAL_ACCOUNT_EMAILS").unwrap_or_default(),
            ),
            tier_prices,
            stripe,
            nowpayments,
            auth0_management,
            leakcheck_api_key: optional_env("LEAKCHECK_API_KEY"),
            elasticsearch,
            monitoring_scan_interval_secs: parse_env("MONITORING_SCAN_INTERVAL_SECS", 3600)?,
            rate_limit_per_minute: parse_env("RATE_LIMIT_PER_MINUTE", 60)?,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_env(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' has an invalid value")),
        None => Ok(default),
    }
}

fn parse_email_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|e| e.trim().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}
