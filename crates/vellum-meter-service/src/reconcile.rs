//! Rollup drift detection and repair.
//!
//! The record log is authoritative; the per-session counters and the
//! exit-page candidate are a cache. Reconciliation recounts a session's
//! records, compares the result with the cached counters, overwrites the
//! cache when they disagree, and re-derives the exit-page flags from the
//! newest page view.

use std::collections::HashSet;

use vellum_meter_core::{SessionId, TelemetryKind};
use vellum_meter_store::Store;

/// Recount one session from its record log and repair its counters and
/// exit-page state if they have drifted. Returns whether a repair was
/// needed.
///
/// # Errors
///
/// Fails if the backend fails.
pub async fn reconcile_session(
    store: &dyn Store,
    id: &SessionId,
) -> Result<bool, vellum_meter_store::StoreError> {
    let Some(session) = store.get_session(id).await? else {
        // Flagged session no longer exists; nothing to repair.
        return Ok(false);
    };

    let (page_views, events_count) = futures::future::try_join(
        store.count_records(id, TelemetryKind::PageView),
        store.count_records(id, TelemetryKind::Event),
    )
    .await?;

    let counters_drifted =
        session.page_views != page_views || session.events_count != events_count;
    if counters_drifted {
        tracing::warn!(
            session_id = %id,
            cached_page_views = session.page_views,
            actual_page_views = page_views,
            cached_events = session.events_count,
            actual_events = events_count,
            "rollup counters drifted, repairing from record log"
        );
        store.set_rollup_counts(id, page_views, events_count).await?;
    }

    // A crashed clear can leave a superseded page view still flagged as
    // the exit page; re-derive the flags from the log every pass.
    let exit_repaired = store.repair_exit_page(id).await?;
    if exit_repaired {
        tracing::warn!(session_id = %id, "exit-page state drifted, repaired from record log");
    }

    Ok(counters_drifted || exit_repaired)
}

/// Reconcile a set of explicitly flagged sessions plus every session
/// that is still open. Returns how many sessions needed repair.
///
/// # Errors
///
/// Fails if the backend fails; sessions reconciled before the failure
/// stay repaired.
pub async fn run(
    store: &dyn Store,
    flagged: Vec<SessionId>,
) -> Result<usize, vellum_meter_store::StoreError> {
    let mut targets: HashSet<SessionId> = flagged.into_iter().collect();
    targets.extend(store.list_active_sessions().await?);

    let mut repaired = 0;
    for id in targets {
        if reconcile_session(store, &id).await? {
            repaired += 1;
        }
    }
    Ok(repaired)
}
