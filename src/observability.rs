use std::net::SocketAddr;

use crate::model::AppointmentStatus;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking attempts. Labels: outcome (booked, overbooked, full).
pub const BOOKINGS_TOTAL: &str = "clinicsched_bookings_total";

/// Histogram: minutes requested per successful booking.
pub const BOOKED_MINUTES: &str = "clinicsched_booked_minutes";

/// Counter: status transitions. Labels: status (target status).
pub const STATUS_TRANSITIONS_TOTAL: &str = "clinicsched_status_transitions_total";

/// Counter: appointments whose duration had to be assumed zero.
pub const DATA_QUALITY_WARNINGS_TOTAL: &str = "clinicsched_data_quality_warnings_total";

// ── Batch metrics ───────────────────────────────────────────────

/// Counter: reconciliation runs.
pub const RECONCILE_RUNS_TOTAL: &str = "clinicsched_reconcile_runs_total";

/// Counter: appointments moved by reconciliation. Labels: status.
pub const RECONCILE_UPDATED_TOTAL: &str = "clinicsched_reconcile_updated_total";

/// Counter: appointments reconciliation failed to move.
pub const RECONCILE_FAILED_TOTAL: &str = "clinicsched_reconcile_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: time slots held in memory.
pub const TIME_SLOTS_ACTIVE: &str = "clinicsched_time_slots_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "clinicsched_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "clinicsched_wal_flush_batch_size";

/// Counter: WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "clinicsched_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a status.
pub fn status_label(status: AppointmentStatus) -> &'static str {
    match status {
        AppointmentStatus::Scheduled => "scheduled",
        AppointmentStatus::Rescheduled => "rescheduled",
        AppointmentStatus::Waiting => "waiting",
        AppointmentStatus::WalkIn => "walkin",
        AppointmentStatus::InConsultation => "in_consultation",
        AppointmentStatus::Completed => "completed",
        AppointmentStatus::Cancelled => "cancelled",
        AppointmentStatus::Missed => "missed",
    }
}
