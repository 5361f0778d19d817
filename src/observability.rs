use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "envbook_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "envbook_http_request_duration_seconds";

/// Counter: requests rejected for a missing, malformed or unknown bearer token.
pub const AUTH_FAILURES_TOTAL: &str = "envbook_auth_failures_total";

/// Counter: reservation writes rejected for overlapping an existing reservation.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "envbook_reservation_conflicts_total";

// ── USE metrics (engine and WAL) ──────────────────────────

/// Gauge: environments currently registered.
pub const ENVIRONMENTS_ACTIVE: &str = "envbook_environments_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "envbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "envbook_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "envbook_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Status label for request metrics.
pub fn status_label(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        400 => "400",
        401 => "401",
        404 => "404",
        409 => "409",
        400..=499 => "4xx",
        _ => "5xx",
    }
}
