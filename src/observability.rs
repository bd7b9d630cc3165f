use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomledger_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomledger_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomledger_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomledger_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomledger_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomledger_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const COMPACTIONS_TOTAL: &str = "roomledger_compactions_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: lessons committed to the ledger.
pub const LESSONS_BOOKED_TOTAL: &str = "roomledger_lessons_booked_total";

/// Counter: bookings rejected because the slot was taken.
pub const CONFLICTS_REJECTED_TOTAL: &str = "roomledger_conflicts_rejected_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::InsertLesson { .. } => "insert_lesson",
        Command::BatchInsertLessons { .. } => "batch_insert_lessons",
        Command::DeleteLesson { .. } => "delete_lesson",
        Command::SelectRooms => "select_rooms",
        Command::SelectLessons { .. } => "select_lessons",
        Command::SelectConflictCheck { .. } => "conflict_check",
        Command::SelectFreeRooms { .. } => "free_rooms",
        Command::SelectRoomAvailability { .. } => "room_availability",
        Command::SelectOccupancyReport => "occupancy_report",
        Command::SelectEquipmentReport => "equipment_report",
        Command::SelectStats { .. } => "stats",
    }
}
