use std::net::SocketAddr;

// ── Operation outcomes ──────────────────────────────────────────

/// Counter: claim attempts. Labels: outcome.
pub const CLAIMS_TOTAL: &str = "reserva_claims_total";

/// Counter: release attempts. Labels: outcome.
pub const RELEASES_TOTAL: &str = "reserva_releases_total";

/// Counter: booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "reserva_bookings_total";

/// Counter: cancellation attempts. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "reserva_cancellations_total";

// ── Commit path ─────────────────────────────────────────────────

/// Histogram: apply + journal latency of one atomic commit, in seconds.
pub const COMMIT_DURATION_SECONDS: &str = "reserva_commit_duration_seconds";

/// Counter: journal appends retried after a failure.
pub const COMMIT_RETRIES_TOTAL: &str = "reserva_commit_retries_total";

/// Counter: commits rolled back because a step failed or the journal gave up.
pub const ATOMICITY_FAILURES_TOTAL: &str = "reserva_atomicity_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reserva_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reserva_wal_flush_batch_size";

// ── State ───────────────────────────────────────────────────────

/// Gauge: active claims past their due time, as of the last sweep.
pub const OVERDUE_CLAIMS: &str = "reserva_overdue_claims";

/// Gauge: inventories plus venues currently in the store.
pub const RESOURCES: &str = "reserva_resources";

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

/// Label for an operation result.
pub fn outcome_label<T>(result: &Result<T, crate::engine::EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    }
}
