//! In-memory storage implementation.
//!
//! This module provides the [`MemoryStore`] implementation of the [`Store`]
//! trait. Each account and session row lives behind its own mutex, which is
//! the row-level serialization point the concurrency model requires: the
//! read-check-increment sequence locks one row and nothing else, so callers
//! on different identities never contend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vellum_meter_core::{
    ChatAggregate, ConversationId, LedgerKey, QuotaAccount, QuotaStatus, RecordId, Session,
    SessionId, TelemetryKind, TelemetryRecord, UserId,
};

use crate::error::{Result, StoreError};
use crate::{RollupOutcome, Store};

/// In-process storage backend.
///
/// Default backend for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryStore {
    accounts: RwLock<HashMap<LedgerKey, Arc<Mutex<QuotaAccount>>>>,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    // BTreeMap keyed by ULID keeps the log in time order.
    records: RwLock<BTreeMap<RecordId, TelemetryRecord>>,
    chats: RwLock<HashMap<ConversationId, ChatAggregate>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_row<'a, T>(row: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
        row.lock().map_err(|_| poisoned())
    }

    /// Get the account row for `key`, creating it on first use (upsert
    /// semantics). `limit` seeds new authenticated rows.
    fn account_row(
        &self,
        key: &LedgerKey,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Arc<Mutex<QuotaAccount>>> {
        if let Some(row) = self.accounts.read().map_err(|_| poisoned())?.get(key) {
            return Ok(Arc::clone(row));
        }

        let mut map = self.accounts.write().map_err(|_| poisoned())?;
        let row = map.entry(*key).or_insert_with(|| {
            let fresh = match key {
                LedgerKey::User(user_id) => QuotaAccount::new_authenticated(*user_id, limit),
                LedgerKey::Visitor(session_id) => QuotaAccount::new_anonymous(*session_id, now),
            };
            Arc::new(Mutex::new(fresh))
        });
        Ok(Arc::clone(row))
    }

    fn session_row(&self, id: &SessionId) -> Result<Option<Arc<Mutex<Session>>>> {
        Ok(self
            .sessions
            .read()
            .map_err(|_| poisoned())?
            .get(id)
            .map(Arc::clone))
    }
}

fn poisoned() -> StoreError {
    StoreError::Database("lock poisoned".into())
}

#[async_trait]
impl Store for MemoryStore {
    // =========================================================================
    // Quota Operations
    // =========================================================================

    async fn get_quota_account(&self, key: &LedgerKey) -> Result<Option<QuotaAccount>> {
        let row = {
            let map = self.accounts.read().map_err(|_| poisoned())?;
            map.get(key).map(Arc::clone)
        };
        match row {
            Some(row) => Ok(Some(Self::lock_row(&row)?.clone())),
            None => Ok(None),
        }
    }

    async fn set_account_limit(&self, user_id: &UserId, limit: i64) -> Result<()> {
        let key = LedgerKey::User(*user_id);
        let row = self.account_row(&key, limit, Utc::now())?;
        let mut account = Self::lock_row(&row)?;
        if let QuotaAccount::Authenticated {
            limit: row_limit, ..
        } = &mut *account
        {
            *row_limit = limit;
        }
        Ok(())
    }

    async fn consume(
        &self,
        key: &LedgerKey,
        cost: i64,
        limit: i64,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> Result<QuotaStatus> {
        let row = self.account_row(key, limit, now)?;
        let mut account = Self::lock_row(&row)?;

        match &mut *account {
            QuotaAccount::Authenticated {
                limit: row_limit,
                used,
                reset_at,
                ..
            } => {
                // Roll the window first, as part of the same atomic step.
                if reset_at.map_or(true, |boundary| now >= boundary) {
                    *used = 0;
                    *reset_at = Some(next_reset);
                }

                if *used + cost <= *row_limit {
                    *used += cost;
                    Ok(QuotaStatus {
                        limit: *row_limit,
                        used: *used,
                        remaining: *row_limit - *used,
                        reset_at: *reset_at,
                    })
                } else {
                    Err(StoreError::QuotaExceeded {
                        limit: *row_limit,
                        used: *used,
                        reset_at: *reset_at,
                    })
                }
            }
            QuotaAccount::Anonymous {
                used, last_used_at, ..
            } => {
                // No window to roll; the anonymous cap is for a lifetime.
                if *used + cost <= limit {
                    *used += cost;
                    *last_used_at = now;
                    Ok(QuotaStatus {
                        limit,
                        used: *used,
                        remaining: limit - *used,
                        reset_at: None,
                    })
                } else {
                    Err(StoreError::QuotaExceeded {
                        limit,
                        used: *used,
                        reset_at: None,
                    })
                }
            }
        }
    }

    async fn refund(&self, key: &LedgerKey, amount: i64, limit: i64) -> Result<QuotaStatus> {
        let row = {
            let map = self.accounts.read().map_err(|_| poisoned())?;
            map.get(key).map(Arc::clone)
        };
        let row = row.ok_or_else(|| StoreError::NotFound {
            entity: "quota account",
            id: key.to_string(),
        })?;

        let mut account = Self::lock_row(&row)?;
        match &mut *account {
            QuotaAccount::Authenticated { used, .. } | QuotaAccount::Anonymous { used, .. } => {
                *used = (*used - amount).max(0);
            }
        }
        Ok(account.status(limit))
    }

    async fn roll_window_if_due(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> Result<bool> {
        let row = {
            let map = self.accounts.read().map_err(|_| poisoned())?;
            map.get(&LedgerKey::User(*user_id)).map(Arc::clone)
        };
        let Some(row) = row else {
            return Ok(false);
        };

        let mut account = Self::lock_row(&row)?;
        if let QuotaAccount::Authenticated {
            used, reset_at, ..
        } = &mut *account
        {
            if reset_at.is_some_and(|boundary| now >= boundary) {
                *used = 0;
                *reset_at = Some(next_reset);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn list_due_accounts(&self, now: DateTime<Utc>) -> Result<Vec<UserId>> {
        let rows: Vec<(UserId, Arc<Mutex<QuotaAccount>>)> = {
            let map = self.accounts.read().map_err(|_| poisoned())?;
            map.iter()
                .filter_map(|(key, row)| match key {
                    LedgerKey::User(user_id) => Some((*user_id, Arc::clone(row))),
                    LedgerKey::Visitor(_) => None,
                })
                .collect()
        };

        let mut due = Vec::new();
        for (user_id, row) in rows {
            let account = Self::lock_row(&row)?;
            if account.reset_at().is_some_and(|boundary| now >= boundary) {
                due.push(user_id);
            }
        }
        Ok(due)
    }

    // =========================================================================
    // Session Operations
    // =========================================================================

    async fn put_session(&self, session: &Session) -> Result<()> {
        self.sessions
            .write()
            .map_err(|_| poisoned())?
            .insert(session.id, Arc::new(Mutex::new(session.clone())));
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        match self.session_row(id)? {
            Some(row) => Ok(Some(Self::lock_row(&row)?.clone())),
            None => Ok(None),
        }
    }

    async fn end_session(&self, id: &SessionId, ended_at: DateTime<Utc>) -> Result<Session> {
        let row = self.session_row(id)?.ok_or_else(|| StoreError::NotFound {
            entity: "session",
            id: id.to_string(),
        })?;

        let mut session = Self::lock_row(&row)?;
        if session.ended_at.is_none() {
            session.ended_at = Some(ended_at);
        }
        Ok(session.clone())
    }

    async fn list_active_sessions(&self) -> Result<Vec<SessionId>> {
        let rows: Vec<Arc<Mutex<Session>>> = {
            let map = self.sessions.read().map_err(|_| poisoned())?;
            map.values().map(Arc::clone).collect()
        };

        let mut active = Vec::new();
        for row in rows {
            let session = Self::lock_row(&row)?;
            if session.is_active() {
                active.push(session.id);
            }
        }
        Ok(active)
    }

    // =========================================================================
    // Telemetry Operations
    // =========================================================================

    async fn append_record(&self, record: &TelemetryRecord) -> Result<()> {
        self.records
            .write()
            .map_err(|_| poisoned())?
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn apply_rollup(
        &self,
        id: &SessionId,
        kind: TelemetryKind,
        now: DateTime<Utc>,
        record_id: RecordId,
    ) -> Result<RollupOutcome> {
        let row = self.session_row(id)?.ok_or_else(|| StoreError::NotFound {
            entity: "session",
            id: id.to_string(),
        })?;

        let mut session = Self::lock_row(&row)?;
        if !session.is_active() {
            return Err(StoreError::SessionEnded {
                session_id: id.to_string(),
            });
        }

        session.last_active_at = now;
        let superseded = match kind {
            TelemetryKind::PageView => {
                session.page_views += 1;
                session.last_page_view.replace(record_id)
            }
            TelemetryKind::Event => {
                session.events_count += 1;
                None
            }
            // Chat turns touch the per-conversation aggregate, not the rollup.
            TelemetryKind::ChatTurn => None,
        };
        session.bounce = session.page_views == 1 && session.events_count == 0;

        Ok(RollupOutcome {
            session: session.clone(),
            superseded_page_view: superseded,
        })
    }

    async fn clear_exit_page(&self, record_id: &RecordId) -> Result<()> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let record = records.get_mut(record_id).ok_or_else(|| StoreError::NotFound {
            entity: "telemetry record",
            id: record_id.to_string(),
        })?;
        record.exit_page = Some(false);
        Ok(())
    }

    async fn repair_exit_page(&self, id: &SessionId) -> Result<bool> {
        let row = self.session_row(id)?.ok_or_else(|| StoreError::NotFound {
            entity: "session",
            id: id.to_string(),
        })?;

        let mut changed = false;
        {
            let mut records = self.records.write().map_err(|_| poisoned())?;
            // ULID keys keep the log in time order, so the last matching
            // page view is the newest.
            let newest = records
                .iter()
                .rev()
                .find(|(_, r)| r.session_id == *id && r.kind == TelemetryKind::PageView)
                .map(|(record_id, _)| *record_id);

            for record in records
                .values_mut()
                .filter(|r| r.session_id == *id && r.kind == TelemetryKind::PageView)
            {
                let want = Some(newest == Some(record.id));
                if record.exit_page != want {
                    record.exit_page = want;
                    changed = true;
                }
            }

            let mut session = Self::lock_row(&row)?;
            if session.last_page_view != newest {
                session.last_page_view = newest;
                changed = true;
            }
        }
        Ok(changed)
    }

    async fn count_records(&self, id: &SessionId, kind: TelemetryKind) -> Result<i64> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let count = records
            .values()
            .filter(|r| r.session_id == *id && r.kind == kind)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn list_records(&self, id: &SessionId, limit: usize) -> Result<Vec<TelemetryRecord>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records
            .values()
            .filter(|r| r.session_id == *id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_rollup_counts(
        &self,
        id: &SessionId,
        page_views: i64,
        events_count: i64,
    ) -> Result<()> {
        let row = self.session_row(id)?.ok_or_else(|| StoreError::NotFound {
            entity: "session",
            id: id.to_string(),
        })?;

        let mut session = Self::lock_row(&row)?;
        session.page_views = page_views;
        session.events_count = events_count;
        session.bounce = page_views == 1 && events_count == 0;
        Ok(())
    }

    // =========================================================================
    // Chat Aggregates
    // =========================================================================

    async fn increment_chat_turns(
        &self,
        conversation_id: &ConversationId,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut chats = self.chats.write().map_err(|_| poisoned())?;
        let aggregate = chats
            .entry(*conversation_id)
            .and_modify(|a| {
                a.turns += 1;
                a.last_turn_at = now;
            })
            .or_insert_with(|| ChatAggregate {
                conversation_id: *conversation_id,
                turns: 1,
                last_turn_at: now,
            });
        Ok(aggregate.turns)
    }

    async fn get_chat_aggregate(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ChatAggregate>> {
        Ok(self
            .chats
            .read()
            .map_err(|_| poisoned())?
            .get(conversation_id)
            .cloned())
    }
}
