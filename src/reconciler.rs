use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine, ReconcileReport};
use crate::model::Ms;

/// One reconciliation pass at `now`, logged.
pub async fn reconcile_once(engine: &Engine, now: Ms) -> ReconcileReport {
    let report = engine.reconcile_past_due(now).await;
    for appt in &report.updated {
        info!(appointment = %appt.id, status = %appt.status, "reconciled past-due appointment");
    }
    for (id, e) in &report.failed {
        warn!(appointment = %id, "reconciliation left appointment unchanged: {e}");
    }
    if report.is_empty() {
        debug!("reconciliation found nothing past due");
    }
    report
}

/// Background task that closes out past-due appointments every `period`.
pub async fn run_reconciler(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        reconcile_once(&engine, now_ms()).await;
    }
}

/// Background task that compacts the WAL once `threshold` appends have
/// accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
