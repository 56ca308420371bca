use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use auth_reliability::{
    attempt_key, AlertSeverity, AuthReliabilityMonitor, ErrorCategory, LogLevel, LogSink,
    MonitorConfig, OperationCategory, RawFailure, RecoveryKind, RecoveryStrategy, StrategyTable,
    ThresholdUpdate,
};
use tokio_test::{assert_err, assert_ok};

#[derive(Default)]
struct CollectingSink {
    entries: Mutex<Vec<(String, LogLevel)>>,
}

impl CollectingSink {
    fn messages_at(&self, level: LogLevel) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, l)| *l == level)
            .map(|(m, _)| m.clone())
            .collect()
    }
}

impl LogSink for CollectingSink {
    fn emit(
        &self,
        message: &str,
        level: LogLevel,
        _context: &serde_json::Value,
    ) -> auth_reliability::Result<()> {
        self.entries.lock().unwrap().push((message.to_string(), level));
        Ok(())
    }
}

fn monitor_with_sink() -> Result<(AuthReliabilityMonitor, Arc<CollectingSink>)> {
    let sink = Arc::new(CollectingSink::default());
    let monitor = AuthReliabilityMonitor::with_sink(MonitorConfig::default(), sink.clone())?;
    Ok((monitor, sink))
}

#[tokio::test(start_paused = true)]
async fn test_failing_sync_raises_and_resolves_alerts() -> Result<()> {
    let (monitor, sink) = monitor_with_sink()?;
    let category = OperationCategory::SessionPersistenceSync;
    let options = auth_reliability::ExecuteOptions::default().max_attempts(1);

    for i in 0..5 {
        let key = attempt_key("session_sync", &format!("user-{}", i));
        let result = monitor
            .execute_with(&key, category, options, || async {
                Err::<(), _>(RawFailure::new("fetch failed: connection reset"))
            })
            .await;
        let error = assert_err!(result);
        assert_eq!(error.category, ErrorCategory::Network);
    }
    assert!(monitor.should_stop_polling(category));

    let report = monitor.generate_report();
    assert_eq!(report.active_alerts.len(), 1);
    assert_eq!(report.active_alerts[0].severity, AlertSeverity::Critical);
    assert_eq!(sink.messages_at(LogLevel::Error).len(), 1);

    let ok = monitor
        .execute(&attempt_key("session_sync", "user-0"), category, || async {
            Ok::<_, RawFailure>("synced")
        })
        .await;
    assert_eq!(assert_ok!(ok), "synced");
    assert!(!monitor.should_stop_polling(category));

    let report = monitor.generate_report();
    assert!(report.active_alerts.is_empty());
    assert_eq!(monitor.get_resolved_alerts().len(), 1);
    let resolved = sink.messages_at(LogLevel::Info);
    assert!(resolved.iter().any(|m| m.starts_with("Alert resolved")));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_permission_failure_is_surfaced_once_with_fallback() -> Result<()> {
    let redirects = Arc::new(AtomicU32::new(0));
    let counter = redirects.clone();
    let strategies = StrategyTable::default().with_category(
        ErrorCategory::Permission,
        RecoveryStrategy::terminal(RecoveryKind::Redirect).with_fallback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let monitor = AuthReliabilityMonitor::new(MonitorConfig::default())?.with_strategies(strategies);

    let calls = Arc::new(AtomicU32::new(0));
    let attempts = calls.clone();
    let result = monitor
        .execute("generate_cookie_u9", OperationCategory::CookieGeneration, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(RawFailure::named("AuthApiError", "forbidden").with_status(403)) }
        })
        .await;

    let error = assert_err!(result);
    assert_eq!(error.category, ErrorCategory::Permission);
    assert!(!error.retryable);
    assert_eq!(error.code.as_deref(), Some("http_403"));
    assert_eq!(error.recovery, RecoveryKind::Redirect);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(redirects.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_periodic_reporting_lifecycle() -> Result<()> {
    let (monitor, sink) = monitor_with_sink()?;
    monitor.update_thresholds(ThresholdUpdate {
        reporting_interval_ms: Some(1_000),
        ..Default::default()
    })?;

    monitor.start()?;
    monitor.start()?;
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    monitor.stop();

    assert_eq!(monitor.get_report_history().len(), 2);
    assert_eq!(
        sink.messages_at(LogLevel::Info)
            .iter()
            .filter(|m| m.as_str() == "Auth reliability report")
            .count(),
        2
    );

    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert_eq!(monitor.get_report_history().len(), 2);
    assert_eq!(monitor.get_performance_trends("total_operations")?.len(), 2);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_slow_average_raises_performance_alert() -> Result<()> {
    let (monitor, sink) = monitor_with_sink()?;
    let start = chrono::Utc::now();
    for ms in [900, 1_100, 1_300] {
        monitor.record(
            OperationCategory::MiddlewareCompatibility,
            start,
            start + chrono::Duration::milliseconds(ms),
            true,
            None,
        );
    }

    let report = monitor.generate_report();
    assert_eq!(report.active_alerts.len(), 1);
    assert_eq!(report.active_alerts[0].severity, AlertSeverity::Medium);
    assert_eq!(report.warnings, vec!["Slow Operation in middleware_compatibility".to_string()]);
    assert_eq!(sink.messages_at(LogLevel::Warn).len(), 1);

    Ok(())
}
