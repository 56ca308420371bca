//! Auth reliability probe
//!
//! Drives simulated auth operations through the monitor and prints the
//! resulting performance report as JSON.
//!
//! Usage: `auth-reliability-probe [CONFIG_FILE]`. Set
//! `AUTH_RELIABILITY_METRICS_ADDR` (e.g. `127.0.0.1:9464`) to expose
//! Prometheus metrics while it runs.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use auth_reliability::logging::{generate_correlation_id, with_correlation_id};
use auth_reliability::{
    attempt_key, init_with_config, install_global, telemetry, uninstall_global, OperationCategory,
    RawFailure,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1);
    let monitor = init_with_config(config_path.as_deref()).context("failed to initialize monitor")?;

    if let Ok(addr) = std::env::var("AUTH_RELIABILITY_METRICS_ADDR") {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid AUTH_RELIABILITY_METRICS_ADDR '{}'", addr))?;
        telemetry::install_prometheus_exporter(addr)?;
    }

    let monitor = install_global(monitor);
    monitor.start()?;

    // Cookie validation that fails twice with a transient fetch error, then succeeds
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let validated = with_correlation_id(
        generate_correlation_id(),
        monitor.execute(
            &attempt_key("validate_cookie", "demo-user"),
            OperationCategory::CookieValidation,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    if attempt <= 2 {
                        Err(RawFailure::named(
                            "AuthRetryableFetchError",
                            format!("fetch failed on attempt {}", attempt),
                        ))
                    } else {
                        Ok("session valid")
                    }
                }
            },
        ),
    )
    .await;
    match validated {
        Ok(message) => info!(attempts = calls.load(Ordering::SeqCst), "Validation result: {}", message),
        Err(e) => warn!(error = %e, "Validation failed"),
    }

    // Session sync rejected with an invalid token, which is never retried
    let synced = with_correlation_id(
        generate_correlation_id(),
        monitor.execute(
            &attempt_key("session_sync", "demo-user"),
            OperationCategory::SessionPersistenceSync,
            || async {
                Err::<(), _>(RawFailure::named(
                    "AuthInvalidTokenResponseError",
                    "refresh_token=abc123 rejected",
                ))
            },
        ),
    )
    .await;
    if let Err(e) = synced {
        warn!(
            code = ?e.code,
            recovery = %e.recovery,
            correlation_id = ?e.correlation_id,
            "Session sync failed: {}",
            e.message
        );
    }

    // Compatibility probes against a slow middleware
    for _ in 0..3 {
        let probe = monitor
            .timed_execute(
                OperationCategory::MiddlewareCompatibility,
                Some(Duration::from_millis(150)),
                || async {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    Ok::<_, RawFailure>(())
                },
            )
            .await;
        if let Err(e) = probe {
            warn!(category = %e.category, "Compatibility probe failed: {}", e.message);
        }
    }

    for i in 0..25 {
        monitor.record_effectiveness(OperationCategory::SessionPersistenceSync, i % 3 == 0);
    }

    let report = monitor.generate_report();
    println!("{}", serde_json::to_string_pretty(&report)?);

    uninstall_global();
    Ok(())
}
