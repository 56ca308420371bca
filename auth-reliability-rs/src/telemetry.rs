//! Prometheus export for the counters, histograms and gauges the tracker
//! emits through the `metrics` facade.

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::types::{Result, TrackerError};

/// Registers descriptions for every metric the tracker emits
pub fn describe_metrics() {
    describe_counter!(
        "auth_reliability_attempts_total",
        "Recorded auth operation attempts by category and outcome"
    );
    describe_histogram!(
        "auth_reliability_operation_duration_ms",
        Unit::Milliseconds,
        "Duration of recorded auth operation attempts"
    );
    describe_counter!("auth_reliability_retries_total", "Retries scheduled by category");
    describe_counter!(
        "auth_reliability_retry_exhausted_total",
        "Operations that used up their retry budget"
    );
    describe_counter!("auth_reliability_alerts_raised_total", "Alerts raised by alert kind");
    describe_counter!("auth_reliability_alerts_resolved_total", "Alerts auto-resolved by alert kind");
    describe_gauge!("auth_reliability_active_alerts", "Currently active alerts");
    describe_counter!("auth_reliability_reports_total", "Performance reports generated");
}

/// Installs the Prometheus recorder with a scrape endpoint on `addr`.
///
/// Only one recorder can be installed per process.
pub fn install_prometheus_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| TrackerError::Exporter(format!("Failed to install Prometheus exporter: {}", e)))?;

    describe_metrics();
    info!(addr = %addr, "Prometheus exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_without_recorder_is_noop() {
        describe_metrics();
    }
}
