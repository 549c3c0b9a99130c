use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "lendtrack_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "lendtrack_query_duration_seconds";

/// Counter: lend submissions rejected by validation. Labels: kind.
pub const VALIDATION_FAILURES_TOTAL: &str = "lendtrack_validation_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "lendtrack_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "lendtrack_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "lendtrack_connections_rejected_total";

/// Counter: background WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "lendtrack_wal_compactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lendtrack_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lendtrack_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertItem { .. } => "insert_item",
        Command::UpdateItem { .. } => "update_item",
        Command::DeleteItem { .. } => "delete_item",
        Command::SelectItems { .. } => "select_items",
        Command::InsertUser { .. } => "insert_user",
        Command::DeleteUser { .. } => "delete_user",
        Command::SelectUsers => "select_users",
        Command::InsertLend(_) => "insert_lend",
        Command::UpdateLend { .. } => "update_lend",
        Command::DeleteLend { .. } => "delete_lend",
        Command::SelectLends { .. } => "select_lends",
        Command::InsertNote { .. } => "insert_note",
        Command::DeleteNote { .. } => "delete_note",
        Command::SelectNotes { .. } => "select_notes",
        Command::CheckLend(_) => "check_lend",
        Command::InsertTag { .. } => "insert_tag",
        Command::UpdateTag { .. } => "update_tag",
        Command::DeleteTag { .. } => "delete_tag",
        Command::SelectTags => "select_tags",
        Command::TagItem { .. } => "tag_item",
        Command::UntagItem { .. } => "untag_item",
        Command::SelectItemTags { .. } => "select_item_tags",
    }
}
