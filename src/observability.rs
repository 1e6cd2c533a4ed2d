use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: assignments successfully created.
pub const ASSIGNMENTS_CREATED_TOTAL: &str = "warden_assignments_created_total";

/// Counter: assignment creations rejected because the cell was full.
pub const ASSIGNMENTS_REJECTED_FULL_TOTAL: &str = "warden_assignments_rejected_full_total";

/// Counter: assignments deleted.
pub const ASSIGNMENTS_DELETED_TOTAL: &str = "warden_assignments_deleted_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: cells currently registered.
pub const CELLS_ACTIVE: &str = "warden_cells_active";

/// Gauge: occupants currently registered.
pub const OCCUPANTS_ACTIVE: &str = "warden_occupants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "warden_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "warden_wal_flush_batch_size";

/// Install a Prometheus metrics exporter on the given port. No-op if port is
/// None; embedders that bring their own recorder skip this entirely.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
