use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "innkeep_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "innkeep_query_duration_seconds";

/// Counter: successful booking commits.
pub const BOOKINGS_TOTAL: &str = "innkeep_bookings_total";

/// Counter: booking commits lost to an overlapping restriction.
pub const BOOKING_CONFLICTS_TOTAL: &str = "innkeep_booking_conflicts_total";

/// Counter: confirmation mails delivered.
pub const NOTIFICATIONS_SENT_TOTAL: &str = "innkeep_notifications_sent_total";

/// Counter: confirmation mails that failed to render or deliver.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "innkeep_notifications_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "innkeep_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "innkeep_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "innkeep_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "innkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "innkeep_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom { .. } => "insert_room",
        Command::RenameRoom { .. } => "rename_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::SelectRooms { .. } => "select_rooms",
        Command::InsertRestriction { .. } => "insert_restriction",
        Command::DeleteRestriction { .. } => "delete_restriction",
        Command::SelectRestrictions { .. } => "select_restrictions",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SetProcessed { .. } => "set_processed",
        Command::UpdateGuest { .. } => "update_guest",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SearchAvailability { .. } => "search_availability",
        Command::CheckAvailability { .. } => "check_availability",
        Command::SelectNotification { .. } => "select_notification",
    }
}
