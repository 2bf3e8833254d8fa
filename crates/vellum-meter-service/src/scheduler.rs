//! Background sweep: window resets and rollup reconciliation.
//!
//! The sweep is lazy-evaluation's safety net, not the primary reset
//! mechanism. Live traffic rolls windows on its own via the consume
//! path; the sweep only catches accounts nobody has touched since
//! their boundary passed, so dashboards read fresh numbers without
//! waiting for the next request.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use vellum_meter_core::{next_reset, WindowPolicy};
use vellum_meter_store::{Store, StoreError};

use crate::aggregator::SessionAggregator;
use crate::config::ServiceConfig;
use crate::reconcile;

/// Periodic background maintenance driver.
pub struct ResetScheduler {
    store: Arc<dyn Store>,
    aggregator: Arc<SessionAggregator>,
    window_policy: WindowPolicy,
    interval: Duration,
}

impl ResetScheduler {
    /// Build a scheduler from the shared state components.
    pub fn new(
        store: Arc<dyn Store>,
        aggregator: Arc<SessionAggregator>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            store,
            aggregator,
            window_policy: config.window_policy,
            interval: Duration::from_secs(config.sweep_interval_seconds),
        }
    }

    /// Run the sweep loop until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so startup
            // does not race backend initialization.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_once(Utc::now()).await;
            }
        })
    }

    /// One sweep pass: roll due windows, then reconcile flagged and
    /// open sessions. Failures are logged and retried on the next tick.
    pub async fn run_once(&self, now: DateTime<Utc>) {
        match self.sweep_windows(now).await {
            Ok(rolled) if rolled > 0 => {
                tracing::info!(rolled, "reset sweep rolled overdue windows");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "reset sweep failed");
            }
        }

        let flagged = self.aggregator.take_drift_queue();
        match reconcile::run(self.store.as_ref(), flagged).await {
            Ok(repaired) if repaired > 0 => {
                tracing::info!(repaired, "reconciliation repaired drifted sessions");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "reconciliation sweep failed");
            }
        }
    }

    /// Roll every account whose window boundary has passed.
    async fn sweep_windows(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let due = self.store.list_due_accounts(now).await?;
        let mut rolled = 0;
        for user_id in due {
            let boundary = next_reset(now, self.window_policy);
            // Conditional roll: a consume that beat us here wins.
            if self.store.roll_window_if_due(&user_id, now, boundary).await? {
                rolled += 1;
            }
        }
        Ok(rolled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use vellum_meter_core::{Identity, UserId};
    use vellum_meter_store::MemoryStore;

    fn scheduler_over(store: Arc<MemoryStore>) -> ResetScheduler {
        let config = ServiceConfig::default();
        let aggregator = Arc::new(SessionAggregator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            config.idle_timeout_seconds,
        ));
        ResetScheduler::new(store, aggregator, &config)
    }

    #[tokio::test]
    async fn sweep_rolls_overdue_accounts() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler_over(Arc::clone(&store));

        let identity = Identity::Authenticated {
            user_id: UserId::generate(),
        };
        let key = identity.ledger_key();
        let t0 = Utc::now();
        let boundary = t0 + ChronoDuration::seconds(1);
        store.consume(&key, 3, 5, t0, boundary).await.unwrap();

        // Past the boundary, the untouched account is due.
        let later = boundary + ChronoDuration::seconds(1);
        let rolled = scheduler.sweep_windows(later).await.unwrap();
        assert_eq!(rolled, 1);

        let account = store.get_quota_account(&key).await.unwrap().unwrap();
        assert_eq!(account.used(), 0);

        // Second pass finds nothing due.
        assert_eq!(scheduler.sweep_windows(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_ignores_accounts_inside_their_window() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler_over(Arc::clone(&store));

        let identity = Identity::Authenticated {
            user_id: UserId::generate(),
        };
        let key = identity.ledger_key();
        let t0 = Utc::now();
        let boundary = t0 + ChronoDuration::hours(1);
        store.consume(&key, 3, 5, t0, boundary).await.unwrap();

        assert_eq!(scheduler.sweep_windows(t0).await.unwrap(), 0);
        let account = store.get_quota_account(&key).await.unwrap().unwrap();
        assert_eq!(account.used(), 3);
    }
}
