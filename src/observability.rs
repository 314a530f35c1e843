use std::net::SocketAddr;
use std::time::Instant;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total engine operations. Labels: op, status.
pub const OPS_TOTAL: &str = "valet_ops_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OP_DURATION_SECONDS: &str = "valet_op_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of lots currently managed.
pub const LOTS_ACTIVE: &str = "valet_lots_active";

/// Gauge: number of active (open) bookings across all lots.
pub const BOOKINGS_ACTIVE: &str = "valet_bookings_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "valet_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "valet_wal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if
/// `port` is None — the embedding application decides whether to expose it.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Record one completed engine operation.
pub fn record_op(op: &'static str, status: &'static str, started: Instant) {
    metrics::counter!(OPS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OP_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
}
