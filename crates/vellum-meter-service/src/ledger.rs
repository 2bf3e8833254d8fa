//! Quota enforcement over the storage backend.
//!
//! The ledger is deliberately thin: the atomic read-check-increment
//! lives in the store, keyed by ledger row, so this layer only chooses
//! limits and window boundaries per identity class and translates
//! storage outcomes into quota outcomes. Enforcement fails closed: a
//! storage failure denies the request rather than granting free usage.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use vellum_meter_core::{
    next_reset, Identity, QuotaError, QuotaStatus, UserId, WindowPolicy,
};
use vellum_meter_store::{Store, StoreError};

use crate::config::ServiceConfig;

/// Per-identity usage accounting with atomic check-and-consume.
pub struct QuotaLedger {
    store: Arc<dyn Store>,
    default_user_limit: i64,
    anonymous_limit: i64,
    window_policy: WindowPolicy,
}

impl QuotaLedger {
    /// Build a ledger over a storage backend.
    pub fn new(store: Arc<dyn Store>, config: &ServiceConfig) -> Self {
        Self {
            store,
            default_user_limit: config.default_user_limit,
            anonymous_limit: config.anonymous_limit,
            window_policy: config.window_policy,
        }
    }

    /// Atomically check remaining quota and consume `cost` units.
    ///
    /// # Errors
    ///
    /// - `QuotaError::Exceeded` if the allowance cannot cover `cost`;
    ///   nothing is consumed.
    /// - `QuotaError::InvalidCost` if `cost` is not positive.
    /// - `QuotaError::StorageUnavailable` if the backend fails.
    pub async fn check_and_consume(
        &self,
        identity: &Identity,
        cost: i64,
    ) -> Result<QuotaStatus, QuotaError> {
        self.check_and_consume_at(identity, cost, Utc::now()).await
    }

    /// Clock-explicit variant of [`check_and_consume`](Self::check_and_consume).
    pub async fn check_and_consume_at(
        &self,
        identity: &Identity,
        cost: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaStatus, QuotaError> {
        if cost <= 0 {
            return Err(QuotaError::InvalidCost { cost });
        }

        let key = identity.ledger_key();
        let limit = self.limit_for(identity);
        let boundary = next_reset(now, self.window_policy);

        match self.store.consume(&key, cost, limit, now, boundary).await {
            Ok(status) => {
                tracing::debug!(
                    key = %key,
                    cost,
                    used = status.used,
                    remaining = status.remaining,
                    "quota consumed"
                );
                Ok(status)
            }
            Err(StoreError::QuotaExceeded {
                limit,
                used,
                reset_at,
            }) => {
                tracing::debug!(key = %key, used, limit, "quota denied");
                Err(QuotaError::Exceeded {
                    limit,
                    used,
                    reset_at,
                })
            }
            Err(err) => Err(QuotaError::StorageUnavailable(err.to_string())),
        }
    }

    /// Return previously consumed units to an identity's account.
    ///
    /// Compensating call for operations that consumed quota and then
    /// failed downstream. `used` never drops below zero.
    ///
    /// # Errors
    ///
    /// - `QuotaError::InvalidCost` if `amount` is not positive.
    /// - `QuotaError::AccountMissing` if the account does not exist.
    /// - `QuotaError::StorageUnavailable` if the backend fails.
    pub async fn refund(
        &self,
        identity: &Identity,
        amount: i64,
    ) -> Result<QuotaStatus, QuotaError> {
        if amount <= 0 {
            return Err(QuotaError::InvalidCost { cost: amount });
        }

        let key = identity.ledger_key();
        let limit = self.limit_for(identity);
        match self.store.refund(&key, amount, limit).await {
            Ok(status) => {
                tracing::info!(key = %key, amount, used = status.used, "quota refunded");
                Ok(status)
            }
            Err(StoreError::NotFound { .. }) => Err(QuotaError::AccountMissing(key.to_string())),
            Err(err) => Err(QuotaError::StorageUnavailable(err.to_string())),
        }
    }

    /// Read an identity's quota standing without consuming anything.
    ///
    /// An identity that has never consumed reports a full allowance.
    ///
    /// # Errors
    ///
    /// Fails if the backend fails.
    pub async fn quota_status(&self, identity: &Identity) -> Result<QuotaStatus, QuotaError> {
        let key = identity.ledger_key();
        let account = self
            .store
            .get_quota_account(&key)
            .await
            .map_err(|e| QuotaError::StorageUnavailable(e.to_string()))?;

        match account {
            Some(account) => Ok(account.status(self.anonymous_limit)),
            None => Ok(QuotaStatus {
                limit: self.limit_for(identity),
                used: 0,
                remaining: self.limit_for(identity),
                reset_at: None,
            }),
        }
    }

    /// Change an authenticated account's per-window allowance.
    ///
    /// # Errors
    ///
    /// Fails if `limit` is negative or the backend fails.
    pub async fn set_limit(&self, user_id: &UserId, limit: i64) -> Result<(), QuotaError> {
        if limit < 0 {
            return Err(QuotaError::InvalidCost { cost: limit });
        }
        self.store
            .set_account_limit(user_id, limit)
            .await
            .map_err(|e| QuotaError::StorageUnavailable(e.to_string()))?;
        tracing::info!(user_id = %user_id, limit, "account limit updated");
        Ok(())
    }

    fn limit_for(&self, identity: &Identity) -> i64 {
        if identity.is_authenticated() {
            self.default_user_limit
        } else {
            self.anonymous_limit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_meter_core::SessionId;
    use vellum_meter_store::MemoryStore;

    fn ledger_with(config: ServiceConfig) -> QuotaLedger {
        QuotaLedger::new(Arc::new(MemoryStore::new()), &config)
    }

    fn small_config(user_limit: i64, anon_limit: i64) -> ServiceConfig {
        ServiceConfig {
            default_user_limit: user_limit,
            anonymous_limit: anon_limit,
            ..ServiceConfig::default()
        }
    }

    fn authed() -> Identity {
        Identity::Authenticated {
            user_id: UserId::generate(),
        }
    }

    fn anon() -> Identity {
        Identity::Anonymous {
            session_id: SessionId::generate(),
            ip_address: None,
        }
    }

    #[tokio::test]
    async fn consume_until_exhausted_then_deny() {
        let ledger = ledger_with(small_config(3, 10));
        let identity = authed();

        for used in 1..=3 {
            let status = ledger.check_and_consume(&identity, 1).await.unwrap();
            assert_eq!(status.used, used);
        }

        let err = ledger.check_and_consume(&identity, 1).await.unwrap_err();
        match err {
            QuotaError::Exceeded { limit, used, .. } => {
                assert_eq!(limit, 3);
                assert_eq!(used, 3);
            }
            other => panic!("expected Exceeded, got {other:?}"),
        }

        // Denial consumed nothing.
        let status = ledger.quota_status(&identity).await.unwrap();
        assert_eq!(status.used, 3);
    }

    #[tokio::test]
    async fn window_roll_is_idempotent_at_boundary() {
        let ledger = ledger_with(small_config(5, 10));
        let identity = authed();

        let t0 = Utc::now();
        let first = ledger.check_and_consume_at(&identity, 2, t0).await.unwrap();
        let boundary = first.reset_at.unwrap();

        // Exactly at the boundary the window rolls and the spend restarts.
        let at = ledger
            .check_and_consume_at(&identity, 1, boundary)
            .await
            .unwrap();
        assert_eq!(at.used, 1);
        let next_boundary = at.reset_at.unwrap();
        assert!(next_boundary > boundary);

        // A moment later the already-rolled window must not roll again.
        let later = ledger
            .check_and_consume_at(&identity, 1, boundary + chrono::Duration::milliseconds(1))
            .await
            .unwrap();
        assert_eq!(later.used, 2);
        assert_eq!(later.reset_at.unwrap(), next_boundary);
    }

    #[tokio::test]
    async fn anonymous_allowance_never_replenishes() {
        let ledger = ledger_with(small_config(100, 2));
        let identity = anon();

        ledger.check_and_consume(&identity, 2).await.unwrap();
        let err = ledger.check_and_consume(&identity, 1).await.unwrap_err();
        match err {
            QuotaError::Exceeded { reset_at, .. } => assert!(reset_at.is_none()),
            other => panic!("expected Exceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn authenticated_and_anonymous_ledgers_are_disjoint() {
        let ledger = ledger_with(small_config(5, 2));
        let user_id = UserId::generate();
        let user = Identity::Authenticated { user_id };
        let visitor = Identity::Anonymous {
            session_id: user_id.to_string().parse().unwrap(),
            ip_address: None,
        };

        ledger.check_and_consume(&visitor, 2).await.unwrap();
        // Same raw UUID, separate account.
        let status = ledger.check_and_consume(&user, 1).await.unwrap();
        assert_eq!(status.used, 1);
        assert_eq!(status.limit, 5);
    }

    #[tokio::test]
    async fn refund_restores_allowance() {
        let ledger = ledger_with(small_config(3, 10));
        let identity = authed();

        ledger.check_and_consume(&identity, 3).await.unwrap();
        assert!(ledger.check_and_consume(&identity, 1).await.is_err());

        let status = ledger.refund(&identity, 1).await.unwrap();
        assert_eq!(status.used, 2);
        assert!(ledger.check_and_consume(&identity, 1).await.is_ok());
    }

    #[tokio::test]
    async fn status_for_unknown_identity_reports_full_allowance() {
        let ledger = ledger_with(small_config(7, 10));
        let status = ledger.quota_status(&authed()).await.unwrap();
        assert_eq!(status.used, 0);
        assert_eq!(status.remaining, 7);
        assert!(status.reset_at.is_none());
    }

    #[tokio::test]
    async fn nonpositive_cost_is_rejected() {
        let ledger = ledger_with(small_config(5, 10));
        assert!(matches!(
            ledger.check_and_consume(&authed(), 0).await,
            Err(QuotaError::InvalidCost { cost: 0 })
        ));
        assert!(matches!(
            ledger.check_and_consume(&authed(), -1).await,
            Err(QuotaError::InvalidCost { cost: -1 })
        ));
        assert!(matches!(
            ledger.refund(&authed(), 0).await,
            Err(QuotaError::InvalidCost { cost: 0 })
        ));
    }

    #[tokio::test]
    async fn refund_of_unknown_account_is_reported_missing() {
        let ledger = ledger_with(small_config(5, 10));
        let err = ledger.refund(&authed(), 1).await.unwrap_err();
        assert!(matches!(err, QuotaError::AccountMissing(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_unit_left_two_rapid_calls_one_winner() {
        let ledger = Arc::new(QuotaLedger::new(
            Arc::new(MemoryStore::new()),
            &small_config(10, 10),
        ));
        let identity = authed();
        ledger.check_and_consume(&identity, 9).await.unwrap();

        let a = {
            let ledger = Arc::clone(&ledger);
            let identity = identity.clone();
            tokio::spawn(async move { ledger.check_and_consume(&identity, 1).await })
        };
        let b = {
            let ledger = Arc::clone(&ledger);
            let identity = identity.clone();
            tokio::spawn(async move { ledger.check_and_consume(&identity, 1).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let granted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(granted, 1);
        for result in results {
            match result {
                Ok(status) => assert_eq!(status.remaining, 0),
                Err(QuotaError::Exceeded { limit, used, .. }) => {
                    assert_eq!(limit, 10);
                    assert_eq!(used, 10);
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_consumes_never_oversell() {
        let ledger = Arc::new(QuotaLedger::new(
            Arc::new(MemoryStore::new()),
            &small_config(10, 10),
        ));
        let identity = authed();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let ledger = Arc::clone(&ledger);
            let identity = identity.clone();
            handles.push(tokio::spawn(async move {
                ledger.check_and_consume(&identity, 1).await.is_ok()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);

        let status = ledger.quota_status(&identity).await.unwrap();
        assert_eq!(status.used, 10);
    }
}
