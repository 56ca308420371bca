//! # Performance Reporting
//!
//! Packages rolling metrics and alert state into [`PerformanceReport`]s, on
//! demand or on a fixed cadence, and keeps a bounded report history.

use std::collections::VecDeque;
use std::fmt;
use std::ops::ControlFlow;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::{Alert, AlertEngine};
use crate::config::ThresholdConfig;
use crate::logging::{LogLevel, LogSink};
use crate::recorder::{ErrorPattern, MetricsRecorder};
use crate::schedule::ScheduledTask;
use crate::sync::{lock, read};
use crate::types::{OperationCategory, Result, TrackerError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Totals across every category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub overall_success_rate: f64,
    /// Weighted by the number of retained latency samples per category
    pub average_operation_time_ms: f64,
    pub active_alert_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryBreakdown {
    pub category: OperationCategory,
    pub total_attempts: u64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub average_operation_time_ms: f64,
    pub max_operation_time_ms: u64,
    pub effectiveness_rate: Option<f64>,
    pub top_errors: Vec<ErrorPattern>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub report_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub time_range: TimeRange,
    pub summary: ReportSummary,
    pub categories: Vec<CategoryBreakdown>,
    pub active_alerts: Vec<Alert>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Report values that can be charted over history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendMetric {
    SuccessRate,
    AverageOperationTime,
    TotalOperations,
    FailedOperations,
    ActiveAlerts,
}

impl TrendMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendMetric::SuccessRate => "success_rate",
            TrendMetric::AverageOperationTime => "average_operation_time",
            TrendMetric::TotalOperations => "total_operations",
            TrendMetric::FailedOperations => "failed_operations",
            TrendMetric::ActiveAlerts => "active_alerts",
        }
    }

    fn value(&self, summary: &ReportSummary) -> f64 {
        match self {
            TrendMetric::SuccessRate => summary.overall_success_rate,
            TrendMetric::AverageOperationTime => summary.average_operation_time_ms,
            TrendMetric::TotalOperations => summary.total_operations as f64,
            TrendMetric::FailedOperations => summary.failed_operations as f64,
            TrendMetric::ActiveAlerts => summary.active_alert_count as f64,
        }
    }
}

impl fmt::Display for TrendMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrendMetric {
    type Err = TrackerError;

    /// Accepts snake_case and camelCase names
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success_rate" | "successRate" => Ok(TrendMetric::SuccessRate),
            "average_operation_time" | "averageOperationTime" => {
                Ok(TrendMetric::AverageOperationTime)
            }
            "total_operations" | "totalOperations" => Ok(TrendMetric::TotalOperations),
            "failed_operations" | "failedOperations" => Ok(TrendMetric::FailedOperations),
            "active_alerts" | "activeAlerts" => Ok(TrendMetric::ActiveAlerts),
            other => Err(TrackerError::UnknownMetric(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Builds reports and owns the periodic reporting timer
pub struct ReportAggregator {
    recorder: Arc<MetricsRecorder>,
    alerts: Arc<AlertEngine>,
    thresholds: Arc<RwLock<ThresholdConfig>>,
    sink: Arc<dyn LogSink>,
    history: Mutex<VecDeque<PerformanceReport>>,
    started_at: DateTime<Utc>,
    task: Mutex<Option<ScheduledTask>>,
}

impl fmt::Debug for ReportAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportAggregator")
            .field("history", &lock(&self.history).len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ReportAggregator {
    pub fn new(
        recorder: Arc<MetricsRecorder>,
        alerts: Arc<AlertEngine>,
        thresholds: Arc<RwLock<ThresholdConfig>>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            recorder,
            alerts,
            thresholds,
            sink,
            history: Mutex::new(VecDeque::new()),
            started_at: Utc::now(),
            task: Mutex::new(None),
        }
    }

    /// Snapshots every category, re-evaluates alerts and appends the report to history
    pub fn generate_report(&self) -> PerformanceReport {
        let (top_n, history_limit) = {
            let thresholds = read(&self.thresholds);
            (thresholds.top_error_patterns, thresholds.report_history_limit.max(1))
        };

        let metrics = self.recorder.all_metrics();
        self.alerts.evaluate(&metrics);
        let active_alerts = self.alerts.active_alerts();

        let total: u64 = metrics.values().map(|m| m.total_attempts).sum();
        let successes: u64 = metrics.values().map(|m| m.success_count).sum();
        let failures: u64 = metrics.values().map(|m| m.failure_count).sum();
        let samples: usize = metrics.values().map(|m| m.latency_history.len()).sum();
        let latency_sum: f64 = metrics
            .values()
            .map(|m| m.average_operation_time_ms * m.latency_history.len() as f64)
            .sum();

        let summary = ReportSummary {
            total_operations: total,
            successful_operations: successes,
            failed_operations: failures,
            overall_success_rate: if total == 0 { 0.0 } else { successes as f64 / total as f64 },
            average_operation_time_ms: if samples == 0 { 0.0 } else { latency_sum / samples as f64 },
            active_alert_count: active_alerts.len(),
        };

        let categories: Vec<CategoryBreakdown> = metrics
            .values()
            .map(|m| CategoryBreakdown {
                category: m.category,
                total_attempts: m.total_attempts,
                success_rate: m.success_rate,
                consecutive_failures: m.consecutive_failures,
                average_operation_time_ms: m.average_operation_time_ms,
                max_operation_time_ms: m.max_operation_time_ms,
                effectiveness_rate: (m.effectiveness.events > 0).then(|| m.effectiveness.rate()),
                top_errors: self.recorder.top_errors(m.category, top_n),
            })
            .collect();

        let warnings = active_alerts
            .iter()
            .map(|alert| match alert.operation_category {
                Some(category) => format!("{} in {}", alert.title, category),
                None => alert.title.clone(),
            })
            .collect();

        let mut recommendations: Vec<String> = Vec::new();
        for recommendation in active_alerts.iter().flat_map(|a| a.recommendations.iter()) {
            if !recommendations.contains(recommendation) {
                recommendations.push(recommendation.clone());
            }
        }

        let timestamp = Utc::now();
        let mut history = lock(&self.history);
        let start = history.back().map(|r| r.timestamp).unwrap_or(self.started_at);

        let report = PerformanceReport {
            report_id: Uuid::new_v4(),
            timestamp,
            time_range: TimeRange { start, end: timestamp },
            summary,
            categories,
            active_alerts,
            warnings,
            recommendations,
        };

        history.push_back(report.clone());
        while history.len() > history_limit {
            history.pop_front();
        }
        drop(history);

        counter!("auth_reliability_reports_total", 1);
        debug!(
            report_id = %report.report_id,
            total = report.summary.total_operations,
            alerts = report.summary.active_alert_count,
            "Generated performance report"
        );

        report
    }

    /// Starts the periodic timer, replacing any running one. A zero interval
    /// is rejected and leaves the running timer in place.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_periodic_reporting(self: &Arc<Self>, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(TrackerError::Config(
                "reporting interval must be greater than zero".to_string(),
            ));
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let task = ScheduledTask::every(interval, move || match weak.upgrade() {
            Some(aggregator) => {
                let report = aggregator.generate_report();
                aggregator.forward(&report);
                ControlFlow::Continue(())
            }
            None => ControlFlow::Break(()),
        });

        let previous = lock(&self.task).replace(task);
        if let Some(previous) = previous {
            previous.cancel();
            debug!("Replaced running report timer");
        }
        info!(interval_ms = interval.as_millis() as u64, "Periodic reporting started");
        Ok(())
    }

    /// Cancels the periodic timer, if any
    pub fn stop(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.cancel();
            info!("Periodic reporting stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().map_or(false, |task| !task.is_finished())
    }

    fn forward(&self, report: &PerformanceReport) {
        if LogLevel::Info < read(&self.thresholds).log_level {
            return;
        }

        let context = serde_json::json!({
            "report_id": report.report_id,
            "summary": report.summary,
            "warnings": report.warnings,
        });
        if let Err(e) = self.sink.emit("Auth reliability report", LogLevel::Info, &context) {
            warn!(error = %e, "Log sink rejected report");
        }
    }

    pub fn latest_report(&self) -> Option<PerformanceReport> {
        lock(&self.history).back().cloned()
    }

    /// Reports oldest first
    pub fn report_history(&self) -> Vec<PerformanceReport> {
        lock(&self.history).iter().cloned().collect()
    }

    /// One point per retained report, oldest first
    pub fn performance_trends(&self, metric: TrendMetric) -> Vec<TrendPoint> {
        lock(&self.history)
            .iter()
            .map(|report| TrendPoint {
                timestamp: report.timestamp,
                value: metric.value(&report.summary),
            })
            .collect()
    }

    pub fn clear_history(&self) {
        lock(&self.history).clear();
    }
}
