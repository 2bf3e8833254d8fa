//! `PostgreSQL` storage implementation.
//!
//! This module provides the [`PostgresStore`] implementation of the
//! [`Store`] trait. The atomicity contract is met with row locking: every
//! compound operation runs `SELECT ... FOR UPDATE` (or a single conditional
//! `UPDATE`) inside one transaction, so the database row is the
//! serialization point for concurrent callers on the same identity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use vellum_meter_core::{
    ChatAggregate, ConversationId, LedgerKey, QuotaAccount, QuotaStatus, RecordId, Session,
    SessionId, TelemetryKind, TelemetryRecord, UserId,
};

use crate::error::{Result, StoreError};
use crate::schema;
use crate::{RollupOutcome, Store};

/// Maximum connections in the pool.
const MAX_CONNECTIONS: u32 = 10;

/// PostgreSQL-backed storage implementation.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to the database at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema DDL. Idempotent; run at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if a DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in schema::all_statements() {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        tracing::info!("database schema applied");
        Ok(())
    }
}

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

fn kind_from_str(s: &str) -> Result<TelemetryKind> {
    match s {
        "page_view" => Ok(TelemetryKind::PageView),
        "event" => Ok(TelemetryKind::Event),
        "chat_turn" => Ok(TelemetryKind::ChatTurn),
        other => Err(StoreError::Serialization(format!(
            "unknown telemetry kind: {other}"
        ))),
    }
}

fn session_from_row(row: &PgRow) -> Result<Session> {
    let last_page_view = row
        .try_get::<Option<String>, _>("last_page_view")
        .map_err(db_err)?
        .map(|s| s.parse::<RecordId>())
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Session {
        id: SessionId::from_uuid(row.try_get("id").map_err(db_err)?),
        user_id: row
            .try_get::<Option<uuid::Uuid>, _>("user_id")
            .map_err(db_err)?
            .map(UserId::from_uuid),
        started_at: row.try_get("started_at").map_err(db_err)?,
        last_active_at: row.try_get("last_active_at").map_err(db_err)?,
        ended_at: row.try_get("ended_at").map_err(db_err)?,
        page_views: row.try_get("page_views").map_err(db_err)?,
        events_count: row.try_get("events_count").map_err(db_err)?,
        bounce: row.try_get("bounce").map_err(db_err)?,
        last_page_view,
    })
}

fn record_from_row(row: &PgRow) -> Result<TelemetryRecord> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let kind: String = row.try_get("kind").map_err(db_err)?;

    Ok(TelemetryRecord {
        id: id
            .parse()
            .map_err(|_| StoreError::Serialization(format!("invalid record id: {id}")))?,
        session_id: SessionId::from_uuid(row.try_get("session_id").map_err(db_err)?),
        user_id: row
            .try_get::<Option<uuid::Uuid>, _>("user_id")
            .map_err(db_err)?
            .map(UserId::from_uuid),
        kind: kind_from_str(&kind)?,
        payload: row.try_get("payload").map_err(db_err)?,
        recorded_at: row.try_get("recorded_at").map_err(db_err)?,
        exit_page: row.try_get("exit_page").map_err(db_err)?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    // =========================================================================
    // Quota Operations
    // =========================================================================

    async fn get_quota_account(&self, key: &LedgerKey) -> Result<Option<QuotaAccount>> {
        match key {
            LedgerKey::User(user_id) => {
                let row = sqlx::query(
                    "SELECT quota_limit, used, reset_at FROM user_quotas WHERE user_id = $1",
                )
                .bind(user_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

                row.map(|row| {
                    Ok(QuotaAccount::Authenticated {
                        user_id: *user_id,
                        limit: row.try_get("quota_limit").map_err(db_err)?,
                        used: row.try_get("used").map_err(db_err)?,
                        reset_at: row.try_get("reset_at").map_err(db_err)?,
                    })
                })
                .transpose()
            }
            LedgerKey::Visitor(session_id) => {
                let row = sqlx::query(
                    "SELECT used, created_at, last_used_at FROM visitor_quotas \
                     WHERE session_id = $1",
                )
                .bind(session_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

                row.map(|row| {
                    Ok(QuotaAccount::Anonymous {
                        session_id: *session_id,
                        used: row.try_get("used").map_err(db_err)?,
                        created_at: row.try_get("created_at").map_err(db_err)?,
                        last_used_at: row.try_get("last_used_at").map_err(db_err)?,
                    })
                })
                .transpose()
            }
        }
    }

    async fn set_account_limit(&self, user_id: &UserId, limit: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_quotas (user_id, quota_limit, used, reset_at) \
             VALUES ($1, $2, 0, NULL) \
             ON CONFLICT (user_id) DO UPDATE SET quota_limit = EXCLUDED.quota_limit",
        )
        .bind(user_id.as_uuid())
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
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
        match key {
            LedgerKey::User(user_id) => {
                let mut tx = self.pool.begin().await.map_err(db_err)?;

                sqlx::query(
                    "INSERT INTO user_quotas (user_id, quota_limit, used, reset_at) \
                     VALUES ($1, $2, 0, NULL) ON CONFLICT (user_id) DO NOTHING",
                )
                .bind(user_id.as_uuid())
                .bind(limit)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                // Row lock: concurrent consumes for this user serialize here.
                let row = sqlx::query(
                    "SELECT quota_limit, used, reset_at FROM user_quotas \
                     WHERE user_id = $1 FOR UPDATE",
                )
                .bind(user_id.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;

                let row_limit: i64 = row.try_get("quota_limit").map_err(db_err)?;
                let mut used: i64 = row.try_get("used").map_err(db_err)?;
                let mut reset_at: Option<DateTime<Utc>> =
                    row.try_get("reset_at").map_err(db_err)?;

                // Roll the window first, within the same transaction.
                if reset_at.map_or(true, |boundary| now >= boundary) {
                    used = 0;
                    reset_at = Some(next_reset);
                }

                let granted = used + cost <= row_limit;
                if granted {
                    used += cost;
                }

                // A roll persists even when the check fails.
                sqlx::query(
                    "UPDATE user_quotas SET used = $2, reset_at = $3 WHERE user_id = $1",
                )
                .bind(user_id.as_uuid())
                .bind(used)
                .bind(reset_at)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                tx.commit().await.map_err(db_err)?;

                if granted {
                    Ok(QuotaStatus {
                        limit: row_limit,
                        used,
                        remaining: row_limit - used,
                        reset_at,
                    })
                } else {
                    Err(StoreError::QuotaExceeded {
                        limit: row_limit,
                        used,
                        reset_at,
                    })
                }
            }
            LedgerKey::Visitor(session_id) => {
                let mut tx = self.pool.begin().await.map_err(db_err)?;

                sqlx::query(
                    "INSERT INTO visitor_quotas (session_id, used, created_at, last_used_at) \
                     VALUES ($1, 0, $2, $2) ON CONFLICT (session_id) DO NOTHING",
                )
                .bind(session_id.as_uuid())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                let row = sqlx::query(
                    "SELECT used FROM visitor_quotas WHERE session_id = $1 FOR UPDATE",
                )
                .bind(session_id.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;

                let used: i64 = row.try_get("used").map_err(db_err)?;
                if used + cost > limit {
                    tx.rollback().await.map_err(db_err)?;
                    return Err(StoreError::QuotaExceeded {
                        limit,
                        used,
                        reset_at: None,
                    });
                }

                sqlx::query(
                    "UPDATE visitor_quotas SET used = used + $2, last_used_at = $3 \
                     WHERE session_id = $1",
                )
                .bind(session_id.as_uuid())
                .bind(cost)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                tx.commit().await.map_err(db_err)?;

                Ok(QuotaStatus {
                    limit,
                    used: used + cost,
                    remaining: limit - used - cost,
                    reset_at: None,
                })
            }
        }
    }

    async fn refund(&self, key: &LedgerKey, amount: i64, limit: i64) -> Result<QuotaStatus> {
        let (query, id) = match key {
            LedgerKey::User(user_id) => (
                "UPDATE user_quotas SET used = GREATEST(used - $2, 0) WHERE user_id = $1 \
                 RETURNING quota_limit, used, reset_at",
                *user_id.as_uuid(),
            ),
            LedgerKey::Visitor(session_id) => (
                "UPDATE visitor_quotas SET used = GREATEST(used - $2, 0) WHERE session_id = $1 \
                 RETURNING $3::BIGINT AS quota_limit, used, NULL::TIMESTAMPTZ AS reset_at",
                *session_id.as_uuid(),
            ),
        };

        let mut q = sqlx::query(query).bind(id).bind(amount);
        if matches!(key, LedgerKey::Visitor(_)) {
            q = q.bind(limit);
        }

        let row = q
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "quota account",
                id: key.to_string(),
            })?;

        let row_limit: i64 = row.try_get("quota_limit").map_err(db_err)?;
        let used: i64 = row.try_get("used").map_err(db_err)?;
        Ok(QuotaStatus {
            limit: row_limit,
            used,
            remaining: (row_limit - used).max(0),
            reset_at: row.try_get("reset_at").map_err(db_err)?,
        })
    }

    async fn roll_window_if_due(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> Result<bool> {
        // Single conditional update; racing with a live consume serializes
        // on the row lock and the condition makes the loser a no-op.
        let result = sqlx::query(
            "UPDATE user_quotas SET used = 0, reset_at = $3 \
             WHERE user_id = $1 AND reset_at IS NOT NULL AND reset_at <= $2",
        )
        .bind(user_id.as_uuid())
        .bind(now)
        .bind(next_reset)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_due_accounts(&self, now: DateTime<Utc>) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT user_id FROM user_quotas WHERE reset_at IS NOT NULL AND reset_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(UserId::from_uuid(
                    row.try_get::<uuid::Uuid, _>("user_id").map_err(db_err)?,
                ))
            })
            .collect()
    }

    // =========================================================================
    // Session Operations
    // =========================================================================

    async fn put_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions \
             (id, user_id, started_at, last_active_at, ended_at, page_views, events_count, \
              bounce, last_page_view) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(session.id.as_uuid())
        .bind(session.user_id.map(|id| *id.as_uuid()))
        .bind(session.started_at)
        .bind(session.last_active_at)
        .bind(session.ended_at)
        .bind(session.page_views)
        .bind(session.events_count)
        .bind(session.bounce)
        .bind(session.last_page_view.map(|id| id.to_string()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| session_from_row(&row))
            .transpose()
    }

    async fn end_session(&self, id: &SessionId, ended_at: DateTime<Utc>) -> Result<Session> {
        // Set-once: the condition leaves an already-ended session untouched.
        sqlx::query("UPDATE sessions SET ended_at = $2 WHERE id = $1 AND ended_at IS NULL")
            .bind(id.as_uuid())
            .bind(ended_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "session",
                id: id.to_string(),
            })?;
        session_from_row(&row)
    }

    async fn list_active_sessions(&self) -> Result<Vec<SessionId>> {
        let rows = sqlx::query("SELECT id FROM sessions WHERE ended_at IS NULL")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(SessionId::from_uuid(
                    row.try_get::<uuid::Uuid, _>("id").map_err(db_err)?,
                ))
            })
            .collect()
    }

    // =========================================================================
    // Telemetry Operations
    // =========================================================================

    async fn append_record(&self, record: &TelemetryRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO telemetry_records \
             (id, session_id, user_id, kind, payload, recorded_at, exit_page) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(record.id.to_string())
        .bind(record.session_id.as_uuid())
        .bind(record.user_id.map(|id| *id.as_uuid()))
        .bind(record.kind.as_str())
        .bind(&record.payload)
        .bind(record.recorded_at)
        .bind(record.exit_page)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn apply_rollup(
        &self,
        id: &SessionId,
        kind: TelemetryKind,
        now: DateTime<Utc>,
        record_id: RecordId,
    ) -> Result<RollupOutcome> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "session",
                id: id.to_string(),
            })?;

        let mut session = session_from_row(&row)?;
        if !session.is_active() {
            tx.rollback().await.map_err(db_err)?;
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
            TelemetryKind::ChatTurn => None,
        };
        session.bounce = session.page_views == 1 && session.events_count == 0;

        sqlx::query(
            "UPDATE sessions SET last_active_at = $2, page_views = $3, events_count = $4, \
             bounce = $5, last_page_view = $6 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(session.last_active_at)
        .bind(session.page_views)
        .bind(session.events_count)
        .bind(session.bounce)
        .bind(session.last_page_view.map(|id| id.to_string()))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(RollupOutcome {
            session,
            superseded_page_view: superseded,
        })
    }

    async fn clear_exit_page(&self, record_id: &RecordId) -> Result<()> {
        let result = sqlx::query("UPDATE telemetry_records SET exit_page = FALSE WHERE id = $1")
            .bind(record_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "telemetry record",
                id: record_id.to_string(),
            });
        }
        Ok(())
    }

    async fn repair_exit_page(&self, id: &SessionId) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let session = sqlx::query("SELECT last_page_view FROM sessions WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "session",
                id: id.to_string(),
            })?;
        let pointer: Option<String> = session.try_get("last_page_view").map_err(db_err)?;

        // ULIDs sort chronologically as TEXT, so MAX(id) is the newest view.
        let newest: Option<String> = sqlx::query(
            "SELECT id FROM telemetry_records \
             WHERE session_id = $1 AND kind = 'page_view' \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .map(|row| row.try_get("id").map_err(db_err))
        .transpose()?;

        let mut changed = 0;
        changed += sqlx::query(
            "UPDATE telemetry_records \
             SET exit_page = (id = $2) \
             WHERE session_id = $1 AND kind = 'page_view' AND exit_page IS DISTINCT FROM (id = $2)",
        )
        .bind(id.as_uuid())
        .bind(newest.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        if pointer != newest {
            changed += sqlx::query("UPDATE sessions SET last_page_view = $2 WHERE id = $1")
                .bind(id.as_uuid())
                .bind(newest.as_deref())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();
        }

        tx.commit().await.map_err(db_err)?;
        Ok(changed > 0)
    }

    async fn count_records(&self, id: &SessionId, kind: TelemetryKind) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM telemetry_records WHERE session_id = $1 AND kind = $2",
        )
        .bind(id.as_uuid())
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row.try_get("n").map_err(db_err)
    }

    async fn list_records(&self, id: &SessionId, limit: usize) -> Result<Vec<TelemetryRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM telemetry_records WHERE session_id = $1 ORDER BY id LIMIT $2",
        )
        .bind(id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn set_rollup_counts(
        &self,
        id: &SessionId,
        page_views: i64,
        events_count: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sessions SET page_views = $2, events_count = $3, \
             bounce = ($2 = 1 AND $3 = 0) WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(page_views)
        .bind(events_count)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "session",
                id: id.to_string(),
            });
        }
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
        let row = sqlx::query(
            "INSERT INTO chat_aggregates (conversation_id, turns, last_turn_at) \
             VALUES ($1, 1, $2) \
             ON CONFLICT (conversation_id) DO UPDATE \
             SET turns = chat_aggregates.turns + 1, last_turn_at = EXCLUDED.last_turn_at \
             RETURNING turns",
        )
        .bind(conversation_id.as_uuid())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row.try_get("turns").map_err(db_err)
    }

    async fn get_chat_aggregate(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ChatAggregate>> {
        let row = sqlx::query(
            "SELECT turns, last_turn_at FROM chat_aggregates WHERE conversation_id = $1",
        )
        .bind(conversation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| {
            Ok(ChatAggregate {
                conversation_id: *conversation_id,
                turns: row.try_get("turns").map_err(db_err)?,
                last_turn_at: row.try_get("last_turn_at").map_err(db_err)?,
            })
        })
        .transpose()
    }
}
