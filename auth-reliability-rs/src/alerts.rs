//! # Alerting
//!
//! Threshold rules over rolling metrics. Alerts are deduplicated by a stable
//! [`AlertKey`]: re-triggering an active key refreshes its metrics snapshot,
//! and a key whose condition has cleared is auto-resolved and moved into a
//! bounded history.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ThresholdConfig;
use crate::logging::{LogLevel, LogSink};
use crate::recorder::RollingMetrics;
use crate::sync::{lock, read};
use crate::types::{OperationCategory, TrackerError};

/// Resolved alerts kept for inspection
pub const RESOLVED_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    /// Sink level for a raised alert of this severity
    pub fn log_level(&self, verbosity: LogLevel) -> LogLevel {
        match self {
            AlertSeverity::Critical | AlertSeverity::High => LogLevel::Error,
            AlertSeverity::Medium => LogLevel::Warn,
            AlertSeverity::Low if verbosity == LogLevel::Debug => LogLevel::Debug,
            AlertSeverity::Low => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCategory {
    Performance,
    Reliability,
}

/// Stable identity of an alert type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlertKey {
    LowSuccessRate,
    HighConsecutiveFailures(OperationCategory),
    SlowOperation(OperationCategory),
    LowEffectiveness(OperationCategory),
}

impl AlertKey {
    pub fn kind(&self) -> &'static str {
        match self {
            AlertKey::LowSuccessRate => "low_success_rate",
            AlertKey::HighConsecutiveFailures(_) => "high_consecutive_failures",
            AlertKey::SlowOperation(_) => "slow_operation",
            AlertKey::LowEffectiveness(_) => "low_effectiveness",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            AlertKey::LowSuccessRate => "Low Success Rate",
            AlertKey::HighConsecutiveFailures(_) => "High Consecutive Failures",
            AlertKey::SlowOperation(_) => "Slow Operation",
            AlertKey::LowEffectiveness(_) => "Low Effectiveness",
        }
    }

    pub fn severity(&self) -> AlertSeverity {
        match self {
            AlertKey::LowSuccessRate => AlertSeverity::High,
            AlertKey::HighConsecutiveFailures(_) => AlertSeverity::Critical,
            AlertKey::SlowOperation(_) => AlertSeverity::Medium,
            AlertKey::LowEffectiveness(_) => AlertSeverity::Low,
        }
    }

    pub fn alert_category(&self) -> AlertCategory {
        match self {
            AlertKey::LowSuccessRate | AlertKey::HighConsecutiveFailures(_) => {
                AlertCategory::Reliability
            }
            AlertKey::SlowOperation(_) | AlertKey::LowEffectiveness(_) => {
                AlertCategory::Performance
            }
        }
    }

    pub fn operation_category(&self) -> Option<OperationCategory> {
        match self {
            AlertKey::LowSuccessRate => None,
            AlertKey::HighConsecutiveFailures(category)
            | AlertKey::SlowOperation(category)
            | AlertKey::LowEffectiveness(category) => Some(*category),
        }
    }

    fn recommendations(&self) -> Vec<String> {
        match self {
            AlertKey::LowSuccessRate => vec![
                "Check auth provider availability and network connectivity".to_string(),
                "Review the most frequent error codes in the latest report".to_string(),
            ],
            AlertKey::HighConsecutiveFailures(category) => vec![
                format!("Stop polling {} until the failure is understood", category),
                "Verify session cookies are issued and forwarded by the middleware".to_string(),
            ],
            AlertKey::SlowOperation(category) => vec![
                format!("Investigate latency of {} operations", category),
                "Cache or debounce repeated session reads".to_string(),
            ],
            AlertKey::LowEffectiveness(category) => vec![format!(
                "Revisit the debounce and caching policy for {}",
                category
            )],
        }
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation_category() {
            Some(category) => write!(f, "{}:{}", self.kind(), category),
            None => f.write_str(self.kind()),
        }
    }
}

impl FromStr for AlertKey {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, category) = match s.split_once(':') {
            Some((kind, category)) => (kind, Some(category.parse::<OperationCategory>()?)),
            None => (s, None),
        };

        match (kind, category) {
            ("low_success_rate", None) => Ok(AlertKey::LowSuccessRate),
            ("high_consecutive_failures", Some(c)) => Ok(AlertKey::HighConsecutiveFailures(c)),
            ("slow_operation", Some(c)) => Ok(AlertKey::SlowOperation(c)),
            ("low_effectiveness", Some(c)) => Ok(AlertKey::LowEffectiveness(c)),
            _ => Err(TrackerError::Config(format!("invalid alert key '{}'", s))),
        }
    }
}

impl Serialize for AlertKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AlertKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Snapshot of the values that tripped a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeringMetrics {
    /// The value compared against the threshold
    pub observed: f64,
    pub threshold: f64,
    pub total_attempts: u64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub average_operation_time_ms: f64,
}

impl TriggeringMetrics {
    fn from_metrics(metrics: &RollingMetrics, observed: f64, threshold: f64) -> Self {
        Self {
            observed,
            threshold,
            total_attempts: metrics.total_attempts,
            success_rate: metrics.success_rate,
            consecutive_failures: metrics.consecutive_failures,
            average_operation_time_ms: metrics.average_operation_time_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub key: AlertKey,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub title: String,
    pub operation_category: Option<OperationCategory>,
    pub triggering_metrics: TriggeringMetrics,
    pub recommendations: Vec<String>,
    pub auto_resolved: bool,
    pub resolution_time: Option<DateTime<Utc>>,
}

impl Alert {
    fn raise(key: AlertKey, triggering_metrics: TriggeringMetrics) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            timestamp: Utc::now(),
            severity: key.severity(),
            category: key.alert_category(),
            title: key.title().to_string(),
            operation_category: key.operation_category(),
            triggering_metrics,
            recommendations: key.recommendations(),
            auto_resolved: false,
            resolution_time: None,
        }
    }
}

/// Outcome of one evaluation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertEvaluation {
    pub raised: Vec<Alert>,
    pub updated: Vec<Alert>,
    pub resolved: Vec<Alert>,
}

impl AlertEvaluation {
    pub fn is_quiet(&self) -> bool {
        self.raised.is_empty() && self.resolved.is_empty()
    }
}

#[derive(Debug, Default)]
struct AlertState {
    active: BTreeMap<AlertKey, Alert>,
    resolved: VecDeque<Alert>,
}

/// Evaluates threshold rules and owns the active-alert set
pub struct AlertEngine {
    thresholds: Arc<RwLock<ThresholdConfig>>,
    sink: Arc<dyn LogSink>,
    state: Mutex<AlertState>,
}

impl fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertEngine")
            .field("active", &lock(&self.state).active.len())
            .finish()
    }
}

impl AlertEngine {
    pub fn new(thresholds: Arc<RwLock<ThresholdConfig>>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            thresholds,
            sink,
            state: Mutex::new(AlertState::default()),
        }
    }

    /// Applies every rule to the given snapshots.
    ///
    /// The aggregate rule is evaluated whenever the input is non-empty. A
    /// per-category rule is only evaluated, and can only resolve, for
    /// categories present in `metrics`.
    pub fn evaluate(&self, metrics: &BTreeMap<OperationCategory, RollingMetrics>) -> AlertEvaluation {
        let thresholds = read(&self.thresholds).clone();
        let checks = Self::check_rules(&thresholds, metrics);

        let mut evaluation = AlertEvaluation::default();
        let active_count = {
            let mut state = lock(&self.state);

            for (key, firing) in checks {
                match firing {
                    Some(snapshot) => {
                        if let Some(active) = state.active.get_mut(&key) {
                            active.triggering_metrics = snapshot;
                            evaluation.updated.push(active.clone());
                        } else {
                            let alert = Alert::raise(key, snapshot);
                            state.active.insert(key, alert.clone());
                            evaluation.raised.push(alert);
                        }
                    }
                    None => {
                        if let Some(mut alert) = state.active.remove(&key) {
                            alert.auto_resolved = true;
                            alert.resolution_time = Some(Utc::now());
                            state.resolved.push_back(alert.clone());
                            while state.resolved.len() > RESOLVED_HISTORY_LIMIT {
                                state.resolved.pop_front();
                            }
                            evaluation.resolved.push(alert);
                        }
                    }
                }
            }

            state.active.len()
        };

        gauge!("auth_reliability_active_alerts", active_count as f64);
        for alert in &evaluation.raised {
            counter!("auth_reliability_alerts_raised_total", 1, "alert" => alert.key.kind());
            let level = alert.severity.log_level(thresholds.log_level);
            self.emit(&format!("Alert raised: {}", describe(alert)), level, alert, thresholds.log_level);
        }
        for alert in &evaluation.resolved {
            counter!("auth_reliability_alerts_resolved_total", 1, "alert" => alert.key.kind());
            self.emit(
                &format!("Alert resolved: {}", describe(alert)),
                LogLevel::Info,
                alert,
                thresholds.log_level,
            );
        }
        if !evaluation.updated.is_empty() {
            debug!(count = evaluation.updated.len(), "Refreshed active alerts");
        }

        evaluation
    }

    /// Returns each evaluated key paired with a snapshot when its rule fires
    fn check_rules(
        thresholds: &ThresholdConfig,
        metrics: &BTreeMap<OperationCategory, RollingMetrics>,
    ) -> Vec<(AlertKey, Option<TriggeringMetrics>)> {
        let mut checks = Vec::new();
        if metrics.is_empty() {
            return checks;
        }

        let total: u64 = metrics.values().map(|m| m.total_attempts).sum();
        let successes: u64 = metrics.values().map(|m| m.success_count).sum();
        let rate = if total == 0 { 0.0 } else { successes as f64 / total as f64 };
        let firing = total > thresholds.min_sample_size && rate < thresholds.min_success_rate;
        checks.push((
            AlertKey::LowSuccessRate,
            firing.then(|| aggregate_snapshot(metrics, rate, thresholds.min_success_rate)),
        ));

        for (category, m) in metrics {
            let max_failures = thresholds.max_consecutive_failures;
            checks.push((
                AlertKey::HighConsecutiveFailures(*category),
                (m.consecutive_failures >= max_failures).then(|| {
                    TriggeringMetrics::from_metrics(
                        m,
                        m.consecutive_failures as f64,
                        max_failures as f64,
                    )
                }),
            ));

            let max_time = thresholds.max_operation_time(*category) as f64;
            let slow = !m.latency_history.is_empty() && m.average_operation_time_ms > max_time;
            checks.push((
                AlertKey::SlowOperation(*category),
                slow.then(|| TriggeringMetrics::from_metrics(m, m.average_operation_time_ms, max_time)),
            ));

            let stats = m.effectiveness;
            let ineffective = stats.events >= thresholds.min_effectiveness_events
                && stats.rate() < thresholds.min_effectiveness_rate;
            checks.push((
                AlertKey::LowEffectiveness(*category),
                ineffective.then(|| {
                    TriggeringMetrics::from_metrics(m, stats.rate(), thresholds.min_effectiveness_rate)
                }),
            ));
        }

        checks
    }

    fn emit(&self, message: &str, level: LogLevel, alert: &Alert, verbosity: LogLevel) {
        if level < verbosity {
            return;
        }

        let context = serde_json::to_value(alert).unwrap_or(serde_json::Value::Null);
        if let Err(e) = self.sink.emit(message, level, &context) {
            warn!(error = %e, alert = %alert.key, "Log sink rejected alert");
        }
    }

    /// Active alerts ordered by key
    pub fn active_alerts(&self) -> Vec<Alert> {
        lock(&self.state).active.values().cloned().collect()
    }

    /// Recently resolved alerts, oldest first
    pub fn resolved_alerts(&self) -> Vec<Alert> {
        lock(&self.state).resolved.iter().cloned().collect()
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.active.clear();
        state.resolved.clear();
        gauge!("auth_reliability_active_alerts", 0.0);
    }
}

fn describe(alert: &Alert) -> String {
    match alert.operation_category {
        Some(category) => format!("{} ({})", alert.title, category),
        None => alert.title.clone(),
    }
}

fn aggregate_snapshot(
    metrics: &BTreeMap<OperationCategory, RollingMetrics>,
    rate: f64,
    threshold: f64,
) -> TriggeringMetrics {
    let samples: usize = metrics.values().map(|m| m.latency_history.len()).sum();
    let latency_sum: f64 = metrics
        .values()
        .map(|m| m.average_operation_time_ms * m.latency_history.len() as f64)
        .sum();

    TriggeringMetrics {
        observed: rate,
        threshold,
        total_attempts: metrics.values().map(|m| m.total_attempts).sum(),
        success_rate: rate,
        consecutive_failures: metrics
            .values()
            .map(|m| m.consecutive_failures)
            .max()
            .unwrap_or(0),
        average_operation_time_ms: if samples == 0 {
            0.0
        } else {
            latency_sum / samples as f64
        },
    }
}
