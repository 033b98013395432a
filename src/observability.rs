use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "bookd_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "bookd_http_request_duration_seconds";

// ── Booking engine ──────────────────────────────────────────────

/// Counter: booking attempts by outcome. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "bookd_bookings_total";

/// Counter: busy-time fetches that failed and fell back to "fully free".
pub const BUSY_FETCH_DEGRADED_TOTAL: &str = "bookd_busy_fetch_degraded_total";

/// Counter: confirmation messages that could not be delivered.
pub const NOTIFICATION_FAILURES_TOTAL: &str = "bookd_notification_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookd_wal_flush_batch_size";

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

/// Outcome labels for `BOOKINGS_TOTAL`.
pub mod outcome {
    pub const SYNCED: &str = "synced";
    pub const CALENDAR_FAILED: &str = "calendar_failed";
    pub const CONFLICT: &str = "conflict";
    pub const UNAVAILABLE: &str = "unavailable";
    pub const REJECTED: &str = "rejected";
    pub const ERROR: &str = "error";
}

pub fn record_booking(outcome: &'static str) {
    metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
}
