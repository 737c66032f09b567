use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: wire statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courtbook_queries_total";

/// Histogram: wire statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courtbook_query_duration_seconds";

/// Counter: reservation state changes attempted. Labels: op, outcome (error kind or "ok").
pub const RESERVATIONS_TOTAL: &str = "courtbook_reservations_total";

/// Histogram: engine operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "courtbook_operation_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: partition lock waits that expired.
pub const TXN_LOCK_TIMEOUTS_TOTAL: &str = "courtbook_txn_lock_timeouts_total";

/// Counter: notifications the sender failed to deliver.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "courtbook_notifications_failed_total";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courtbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courtbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtbook_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "courtbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtbook_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "courtbook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertReservation { .. } => "insert_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::InsertApproval { .. } => "insert_approval",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectFacilities { .. } => "select_facilities",
        Command::SelectProfile => "select_profile",
    }
}
