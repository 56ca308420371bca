//! # Reliability Monitor
//!
//! [`AuthReliabilityMonitor`] wires the classifier, retry coordinator,
//! recorder, alert engine and report aggregator around one shared threshold
//! configuration. Lifecycle is `new -> start -> stop`. A process-wide
//! instance can be held through [`install_global`] for callers that have no
//! better place to keep it.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use tracing::info;

use crate::alerts::{Alert, AlertEngine};
use crate::classifier::{ErrorClassifier, RawFailure};
use crate::config::{MonitorConfig, RetryConfig, ThresholdConfig, ThresholdUpdate};
use crate::logging::{LogSink, TracingSink};
use crate::recorder::{MetricsRecorder, RollingMetrics};
use crate::reporting::{PerformanceReport, ReportAggregator, TrendMetric, TrendPoint};
use crate::retry::{ExecuteOptions, RetryCoordinator};
use crate::strategy::StrategyTable;
use crate::sync::{read, write};
use crate::types::{ClassifiedError, OperationCategory, Result};

static GLOBAL_MONITOR: Lazy<RwLock<Option<Arc<AuthReliabilityMonitor>>>> =
    Lazy::new(|| RwLock::new(None));

#[derive(Debug)]
pub struct AuthReliabilityMonitor {
    thresholds: Arc<RwLock<ThresholdConfig>>,
    retry_config: RetryConfig,
    recorder: Arc<MetricsRecorder>,
    alerts: Arc<AlertEngine>,
    reports: Arc<ReportAggregator>,
    retries: RetryCoordinator,
}

impl AuthReliabilityMonitor {
    /// Creates a monitor that logs alerts and reports through `tracing`
    pub fn new(config: MonitorConfig) -> Result<Self> {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    pub fn with_sink(config: MonitorConfig, sink: Arc<dyn LogSink>) -> Result<Self> {
        config.thresholds.validate()?;

        let thresholds = Arc::new(RwLock::new(config.thresholds));
        let recorder = Arc::new(MetricsRecorder::new(thresholds.clone()));
        let alerts = Arc::new(AlertEngine::new(thresholds.clone(), sink.clone()));
        let reports = Arc::new(ReportAggregator::new(
            recorder.clone(),
            alerts.clone(),
            thresholds.clone(),
            sink,
        ));
        let retries = RetryCoordinator::new(
            ErrorClassifier::default(),
            recorder.clone(),
            config.retry.clone(),
        );

        Ok(Self {
            thresholds,
            retry_config: config.retry,
            recorder,
            alerts,
            reports,
            retries,
        })
    }

    /// Replaces the recovery strategy table
    pub fn with_strategies(mut self, strategies: StrategyTable) -> Self {
        self.retries = RetryCoordinator::new(
            ErrorClassifier::new(Arc::new(strategies)),
            self.recorder.clone(),
            self.retry_config.clone(),
        );
        self
    }

    pub fn retries(&self) -> &RetryCoordinator {
        &self.retries
    }

    pub fn classify<F: Into<RawFailure>>(&self, failure: F) -> ClassifiedError {
        self.retries.classifier().classify(failure)
    }

    pub async fn execute<F, Fut, T, E>(
        &self,
        key: &str,
        category: OperationCategory,
        operation: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<RawFailure>,
    {
        self.retries.execute(key, category, operation).await
    }

    pub async fn execute_with<F, Fut, T, E>(
        &self,
        key: &str,
        category: OperationCategory,
        options: ExecuteOptions,
        operation: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<RawFailure>,
    {
        self.retries.execute_with(key, category, options, operation).await
    }

    pub async fn timed_execute<F, Fut, T, E>(
        &self,
        category: OperationCategory,
        timeout: Option<std::time::Duration>,
        operation: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<RawFailure>,
    {
        self.retries.timed_execute(category, timeout, operation).await
    }

    pub fn record(
        &self,
        category: OperationCategory,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        success: bool,
        error_code: Option<&str>,
    ) {
        self.recorder.record(category, start_time, end_time, success, error_code);
    }

    pub fn record_effectiveness(&self, category: OperationCategory, effective: bool) {
        self.recorder.record_effectiveness(category, effective);
    }

    pub fn get_metrics(&self, category: OperationCategory) -> RollingMetrics {
        self.recorder.metrics(category)
    }

    pub fn get_all_metrics(&self) -> BTreeMap<OperationCategory, RollingMetrics> {
        self.recorder.all_metrics()
    }

    pub fn get_active_alerts(&self) -> Vec<Alert> {
        self.alerts.active_alerts()
    }

    pub fn get_resolved_alerts(&self) -> Vec<Alert> {
        self.alerts.resolved_alerts()
    }

    pub fn generate_report(&self) -> PerformanceReport {
        self.reports.generate_report()
    }

    pub fn get_latest_report(&self) -> Option<PerformanceReport> {
        self.reports.latest_report()
    }

    pub fn get_report_history(&self) -> Vec<PerformanceReport> {
        self.reports.report_history()
    }

    /// Trend of a named report metric, e.g. `success_rate` or `averageOperationTime`
    pub fn get_performance_trends(&self, metric: &str) -> Result<Vec<TrendPoint>> {
        let metric: TrendMetric = metric.parse()?;
        Ok(self.reports.performance_trends(metric))
    }

    pub fn should_stop_polling(&self, category: OperationCategory) -> bool {
        self.recorder.should_stop_polling(category)
    }

    pub fn thresholds(&self) -> ThresholdConfig {
        read(&self.thresholds).clone()
    }

    /// Validates and applies a partial threshold change. A running report
    /// timer is restarted when the interval changes.
    pub fn update_thresholds(&self, update: ThresholdUpdate) -> Result<()> {
        let mut next = self.thresholds();
        let previous_interval = next.reporting_interval_ms;
        next.apply(update);
        next.validate()?;

        let interval = next.reporting_interval();
        let interval_changed = next.reporting_interval_ms != previous_interval;
        *write(&self.thresholds) = next;

        if interval_changed && self.reports.is_running() {
            self.reports.start_periodic_reporting(interval)?;
        }
        info!(interval_changed = interval_changed, "Thresholds updated");
        Ok(())
    }

    /// Clears metrics, alerts, report history and retry state
    pub fn reset(&self) {
        self.retries.clear_all();
        self.recorder.reset(None);
        self.alerts.clear();
        self.reports.clear_history();
        info!("Reliability monitor reset");
    }

    /// Starts periodic reporting at the configured interval.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let interval = read(&self.thresholds).reporting_interval();
        self.reports.start_periodic_reporting(interval)
    }

    /// Cancels the report timer and every pending retry
    pub fn stop(&self) {
        self.reports.stop();
        self.retries.clear_all();
    }

    pub fn is_running(&self) -> bool {
        self.reports.is_running()
    }
}

/// Holds `monitor` as the process-wide instance, stopping any previous one
pub fn install_global(monitor: AuthReliabilityMonitor) -> Arc<AuthReliabilityMonitor> {
    let monitor = Arc::new(monitor);
    let previous = write(&GLOBAL_MONITOR).replace(monitor.clone());
    if let Some(previous) = previous {
        previous.stop();
    }
    monitor
}

pub fn global() -> Option<Arc<AuthReliabilityMonitor>> {
    read(&GLOBAL_MONITOR).clone()
}

/// Stops and releases the process-wide instance
pub fn uninstall_global() -> Option<Arc<AuthReliabilityMonitor>> {
    let monitor = write(&GLOBAL_MONITOR).take();
    if let Some(monitor) = &monitor {
        monitor.stop();
    }
    monitor
}
