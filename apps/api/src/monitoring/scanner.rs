//! Background exposure scans.
//!
//! Every instance runs the same scheduler loop. Claims go through the store,
//! which hands each due target to exactly one caller, so running several API
//! replicas never double-scans a target. All scheduling state lives in the
//! database and survives restarts. Targets whose owner's plan has lost
//! monitoring are marked paused instead of scanned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::entitlements::Feature;
use crate::errors::AppError;
use crate::monitoring::models::{MonitoringTarget, ScanOutcome};
use crate::monitoring::store::MonitoringStore;
use crate::search::SearchAggregator;
use crate::subscriptions::TierResolver;

/// How often the scheduler looks for due targets.
const POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Targets claimed per poll.
const CLAIM_BATCH: i64 = 25;
/// A scan still marked running after this long is assumed dead.
const STALE_SCAN_AFTER: Duration = Duration::from_secs(15 * 60);

#[derive(Clone)]
pub struct Scanner {
    store: Arc<dyn MonitoringStore>,
    search: SearchAggregator,
    tiers: TierResolver,
    rescan_after: Duration,
}

impl Scanner {
    pub fn new(
        store: Arc<dyn MonitoringStore>,
        search: SearchAggregator,
        tiers: TierResolver,
        rescan_after: Duration,
    ) -> Self {
        Self {
            store,
            search,
            tiers,
            rescan_after,
        }
    }

    /// Looks the target up across all breach sources and stores the result.
    /// A failed lookup is recorded on the target, not returned as an error.
    pub async fn scan(&self, target: &MonitoringTarget) -> Result<MonitoringTarget, AppError> {
        let outcome = match self
            .search
            .search(&target.value, target.kind.search_kind())
            .await
        {
            Ok(found) => ScanOutcome::Findings(found.records.len()),
            Err(e) => {
                warn!(target = %target.id, "Monitoring scan failed: {e}");
                ScanOutcome::Failed(e.to_string())
            }
        };

        self.finish(target, &outcome).await
    }

    async fn finish(
        &self,
        target: &MonitoringTarget,
        outcome: &ScanOutcome,
    ) -> Result<MonitoringTarget, AppError> {
        self.store
            .finish_scan(target.id, outcome)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Monitoring target {} not found", target.id)))
    }

    /// Whether the target's owner currently has the monitoring feature.
    /// Results are cached per batch since one owner usually has several targets.
    async fn owner_monitors(
        &self,
        owner: &str,
        seen: &mut HashMap<String, bool>,
    ) -> Result<bool, AppError> {
        if let Some(&allowed) = seen.get(owner) {
            return Ok(allowed);
        }
        let resolved = self.tiers.resolve_owner(owner).await?;
        let allowed = resolved.tier.has_feature(Feature::Monitoring);
        seen.insert(owner.to_string(), allowed);
        Ok(allowed)
    }

    /// Claims and scans one batch of due targets. Returns how many were
    /// scanned or paused.
    pub async fn run_due(&self) -> Result<usize, AppError> {
        let now = Utc::now();
        let due_before = now - to_chrono(self.rescan_after);
        let stale_before = now - to_chrono(STALE_SCAN_AFTER);

        let claimed = self
            .store
            .claim_due(due_before, stale_before, CLAIM_BATCH)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        let mut scanned = 0;
        let mut paused = 0;
        let mut owners = HashMap::new();
        for target in &claimed {
            let allowed = match self.owner_monitors(&target.user_sub, &mut owners).await {
                Ok(allowed) => allowed,
                Err(e) => {
                    // Left claimed; picked up again once the claim goes stale.
                    error!(target = %target.id, "Could not resolve target owner's tier: {e}");
                    continue;
                }
            };
            if !allowed {
                match self.finish(target, &ScanOutcome::Paused).await {
                    Ok(_) | Err(AppError::NotFound(_)) => paused += 1,
                    Err(e) => error!(target = %target.id, "Could not pause target: {e}"),
                }
                continue;
            }

            match self.scan(target).await {
                Ok(done) => {
                    scanned += 1;
                    debug!(target = %done.id, status = %done.status, findings = done.findings, "Target scanned");
                }
                // Deleted mid-scan; nothing to record.
                Err(AppError::NotFound(_)) => {}
                Err(e) => error!(target = %target.id, "Could not record scan result: {e}"),
            }
        }
        info!(claimed = claimed.len(), scanned, paused, "Monitoring batch complete");
        Ok(scanned + paused)
    }

    /// Spawns the polling loop. It keeps going until the runtime shuts down.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                rescan_after_secs = self.rescan_after.as_secs(),
                "Monitoring scheduler started"
            );
            loop {
                ticker.tick().await;
                // Drain the backlog before waiting for the next tick.
                loop {
                    match self.run_due().await {
                        Ok(n) if n as i64 >= CLAIM_BATCH => continue,
                        Ok(_) => break,
                        Err(e) => {
                            error!("Monitoring scheduler tick failed: {e}");
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::tiers::Tier;
    use crate::monitoring::models::{ScanStatus, TargetKind};
    use crate::monitoring::store::InMemoryMonitoringStore;
    use crate::search::sources::tests::{leaked, FailingSource, StaticSource};
    use crate::search::BreachSource;
    use crate::subscriptions::{
        InMemorySubscriptionStore, PaymentMethod, SubscriptionStatus, SubscriptionStore,
        SubscriptionUpdate,
    };

    async fn subscribed(user: &str, tier: Tier) -> Arc<InMemorySubscriptionStore> {
        let subs = Arc::new(InMemorySubscriptionStore::new());
        subs.upsert(&SubscriptionUpdate {
            user_sub: user.into(),
            tier,
            status: SubscriptionStatus::Active,
            current_period_end: None,
            payment_method: PaymentMethod::Card,
            stripe_customer_id: None,
            stripe_subscription_id: None,
        })
        .await
        .unwrap();
        subs
    }

    fn scanner(
        store: Arc<InMemoryMonitoringStore>,
        subs: Arc<InMemorySubscriptionStore>,
        source: Arc<dyn BreachSource>,
    ) -> Scanner {
        Scanner::new(
            store,
            SearchAggregator::new(vec![source], Duration::from_secs(1)),
            TierResolver::new(subs, &[]),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_run_due_scans_each_target_once() {
        let store = Arc::new(InMemoryMonitoringStore::new());
        store
            .create("auth0|u", TargetKind::Email, "jane@example.com")
            .await
            .unwrap();
        store
            .create("auth0|u", TargetKind::Domain, "example.com")
            .await
            .unwrap();
        let source = StaticSource::new("s", vec![leaked("jane@example.com", "pw", "Acme")]);
        let subs = subscribed("auth0|u", Tier::Starter).await;
        let scanner = scanner(store.clone(), subs, source.clone());

        assert_eq!(scanner.run_due().await.unwrap(), 2);
        // Freshly scanned: nothing due until the rescan interval passes.
        assert_eq!(scanner.run_due().await.unwrap(), 0);
        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        let targets = store.list("auth0|u").await.unwrap();
        assert!(targets
            .iter()
            .all(|t| t.status == ScanStatus::Exposed && t.findings == 1));
    }

    #[tokio::test]
    async fn test_owner_without_monitoring_is_paused_not_scanned() {
        let store = Arc::new(InMemoryMonitoringStore::new());
        let target = store
            .create("auth0|lapsed", TargetKind::Email, "jane@example.com")
            .await
            .unwrap()
            .unwrap();
        store
            .finish_scan(target.id, &ScanOutcome::Findings(2))
            .await
            .unwrap();
        store
            .create("auth0|paid", TargetKind::Email, "joe@example.com")
            .await
            .unwrap();

        let source = StaticSource::new("s", vec![]);
        let subs = subscribed("auth0|paid", Tier::Professional).await;
        let scanner = Scanner::new(
            store.clone(),
            SearchAggregator::new(vec![source.clone()], Duration::from_secs(1)),
            TierResolver::new(subs, &[]),
            // Everything scanned before now is due again.
            Duration::ZERO,
        );

        scanner.run_due().await.unwrap();
        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let lapsed = store.list("auth0|lapsed").await.unwrap();
        assert_eq!(lapsed[0].status, ScanStatus::Paused);
        assert_eq!(lapsed[0].findings, 2);
        let paid = store.list("auth0|paid").await.unwrap();
        assert_eq!(paid[0].status, ScanStatus::Clean);
    }

    #[tokio::test]
    async fn test_source_failure_marks_target_failed() {
        let store = Arc::new(InMemoryMonitoringStore::new());
        let target = store
            .create("auth0|u", TargetKind::Phone, "+15550100")
            .await
            .unwrap()
            .unwrap();
        let subs = Arc::new(InMemorySubscriptionStore::new());
        let scanned = scanner(store, subs, Arc::new(FailingSource))
            .scan(&target)
            .await
            .unwrap();
        assert_eq!(scanned.status, ScanStatus::Failed);
        assert!(scanned.last_error.is_some());
    }
}
