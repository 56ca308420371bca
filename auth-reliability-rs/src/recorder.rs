//! # Rolling Metrics
//!
//! Per-category counters, failure streaks and a bounded latency window.
//! Each category sits behind its own mutex; nothing outside this module
//! mutates the live metrics, callers only ever receive snapshots.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ThresholdConfig;
use crate::sync::{lock, read};
use crate::types::{OperationAttempt, OperationCategory};

/// Distinct error codes tracked per category before new ones fold into [`OVERFLOW_PATTERN`]
pub const MAX_ERROR_PATTERNS: usize = 64;

pub const OVERFLOW_PATTERN: &str = "other";

/// Share of events where a mitigation (debounce, cache hit) did its job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivenessStats {
    pub events: u64,
    pub effective: u64,
}

impl EffectivenessStats {
    pub fn rate(&self) -> f64 {
        if self.events == 0 {
            0.0
        } else {
            self.effective as f64 / self.events as f64
        }
    }
}

/// Bounded-window statistics for one operation category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingMetrics {
    pub category: OperationCategory,
    pub total_attempts: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
    /// Most recent durations in milliseconds, oldest first
    pub latency_history: VecDeque<u64>,
    pub latency_capacity: usize,
    pub min_operation_time_ms: u64,
    pub max_operation_time_ms: u64,
    pub average_operation_time_ms: f64,
    pub success_rate: f64,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub effectiveness: EffectivenessStats,
}

impl RollingMetrics {
    pub fn new(category: OperationCategory) -> Self {
        Self::with_capacity(category, category.latency_window())
    }

    pub fn with_capacity(category: OperationCategory, latency_capacity: usize) -> Self {
        Self {
            category,
            total_attempts: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            max_consecutive_failures: 0,
            latency_history: VecDeque::with_capacity(latency_capacity),
            latency_capacity: latency_capacity.max(1),
            min_operation_time_ms: 0,
            max_operation_time_ms: 0,
            average_operation_time_ms: 0.0,
            success_rate: 0.0,
            last_attempt_time: None,
            effectiveness: EffectivenessStats::default(),
        }
    }

    fn observe(&mut self, duration_ms: u64, success: bool, at: DateTime<Utc>) {
        self.total_attempts += 1;
        if success {
            self.success_count += 1;
            self.consecutive_failures = 0;
        } else {
            self.failure_count += 1;
            self.consecutive_failures += 1;
            self.max_consecutive_failures =
                self.max_consecutive_failures.max(self.consecutive_failures);
        }

        self.latency_history.push_back(duration_ms);
        while self.latency_history.len() > self.latency_capacity {
            self.latency_history.pop_front();
        }
        self.recompute_latency();

        self.success_rate = self.success_count as f64 / self.total_attempts as f64;
        self.last_attempt_time = Some(at);
    }

    fn recompute_latency(&mut self) {
        if self.latency_history.is_empty() {
            self.min_operation_time_ms = 0;
            self.max_operation_time_ms = 0;
            self.average_operation_time_ms = 0.0;
            return;
        }

        let sum: u64 = self.latency_history.iter().sum();
        self.min_operation_time_ms = self.latency_history.iter().copied().min().unwrap_or(0);
        self.max_operation_time_ms = self.latency_history.iter().copied().max().unwrap_or(0);
        self.average_operation_time_ms = sum as f64 / self.latency_history.len() as f64;
    }
}

/// One entry of an error-frequency ranking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub code: String,
    pub count: u64,
}

#[derive(Debug)]
struct CategoryState {
    metrics: RollingMetrics,
    error_counts: HashMap<String, u64>,
}

impl CategoryState {
    fn new(category: OperationCategory) -> Self {
        Self {
            metrics: RollingMetrics::new(category),
            error_counts: HashMap::new(),
        }
    }

    fn count_error(&mut self, code: &str) {
        let key = if self.error_counts.contains_key(code)
            || self.error_counts.len() < MAX_ERROR_PATTERNS
        {
            code
        } else {
            OVERFLOW_PATTERN
        };
        *self.error_counts.entry(key.to_string()).or_insert(0) += 1;
    }
}

/// Records timed attempts into per-category rolling metrics
#[derive(Debug)]
pub struct MetricsRecorder {
    categories: HashMap<OperationCategory, Mutex<CategoryState>>,
    thresholds: Arc<RwLock<ThresholdConfig>>,
}

impl MetricsRecorder {
    pub fn new(thresholds: Arc<RwLock<ThresholdConfig>>) -> Self {
        let categories = OperationCategory::ALL
            .iter()
            .map(|category| (*category, Mutex::new(CategoryState::new(*category))))
            .collect();

        Self {
            categories,
            thresholds,
        }
    }

    fn state(&self, category: OperationCategory) -> &Mutex<CategoryState> {
        // every category is inserted at construction
        &self.categories[&category]
    }

    /// Records one attempt. Never fails.
    pub fn record(
        &self,
        category: OperationCategory,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        success: bool,
        error_code: Option<&str>,
    ) {
        self.record_attempt(OperationAttempt {
            category,
            start_time,
            end_time,
            success,
            error_code: error_code.map(str::to_string),
        });
    }

    pub fn record_attempt(&self, attempt: OperationAttempt) {
        let duration_ms = attempt.duration_ms();
        let category = attempt.category;

        {
            let mut state = lock(self.state(category));
            state.metrics.observe(duration_ms, attempt.success, attempt.end_time);
            if !attempt.success {
                let code = attempt.error_code.as_deref().unwrap_or("unclassified");
                state.count_error(code);
            }
        }

        let outcome = if attempt.success { "success" } else { "failure" };
        counter!("auth_reliability_attempts_total", 1, "category" => category.as_str(), "outcome" => outcome);
        histogram!("auth_reliability_operation_duration_ms", duration_ms as f64, "category" => category.as_str());

        let limit = read(&self.thresholds).max_operation_time(category);
        if duration_ms > limit {
            warn!(
                category = %category,
                duration_ms = duration_ms,
                threshold_ms = limit,
                success = attempt.success,
                "Slow auth operation"
            );
        } else {
            debug!(category = %category, duration_ms = duration_ms, success = attempt.success, "Recorded attempt");
        }
    }

    /// Records whether a mitigation was effective for one event
    pub fn record_effectiveness(&self, category: OperationCategory, effective: bool) {
        let mut state = lock(self.state(category));
        state.metrics.effectiveness.events += 1;
        if effective {
            state.metrics.effectiveness.effective += 1;
        }
    }

    /// Snapshot of one category
    pub fn metrics(&self, category: OperationCategory) -> RollingMetrics {
        lock(self.state(category)).metrics.clone()
    }

    /// Snapshot of every category, in category order
    pub fn all_metrics(&self) -> std::collections::BTreeMap<OperationCategory, RollingMetrics> {
        OperationCategory::ALL
            .iter()
            .map(|category| (*category, self.metrics(*category)))
            .collect()
    }

    /// Most frequent error codes for a category, highest count first
    pub fn top_errors(&self, category: OperationCategory, limit: usize) -> Vec<ErrorPattern> {
        let state = lock(self.state(category));
        let mut patterns: Vec<ErrorPattern> = state
            .error_counts
            .iter()
            .map(|(code, count)| ErrorPattern {
                code: code.clone(),
                count: *count,
            })
            .collect();

        patterns.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.code.cmp(&b.code)));
        patterns.truncate(limit);
        patterns
    }

    /// True once a category has failed often enough in a row that polling should stop
    pub fn should_stop_polling(&self, category: OperationCategory) -> bool {
        let max = read(&self.thresholds).max_consecutive_failures;
        lock(self.state(category)).metrics.consecutive_failures >= max
    }

    /// Clears one category, or all of them
    pub fn reset(&self, category: Option<OperationCategory>) {
        let targets: Vec<OperationCategory> = match category {
            Some(category) => vec![category],
            None => OperationCategory::ALL.to_vec(),
        };

        for category in targets {
            *lock(self.state(category)) = CategoryState::new(category);
        }
        debug!(category = ?category, "Metrics reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn recorder() -> MetricsRecorder {
        MetricsRecorder::new(Arc::new(RwLock::new(ThresholdConfig::default())))
    }

    fn record_ms(recorder: &MetricsRecorder, category: OperationCategory, ms: i64, success: bool) {
        let start = Utc::now();
        let code = if success { None } else { Some("network") };
        recorder.record(category, start, start + Duration::milliseconds(ms), success, code);
    }

    #[test]
    fn test_success_then_failure() {
        let recorder = recorder();
        record_ms(&recorder, OperationCategory::CookieValidation, 100, true);
        record_ms(&recorder, OperationCategory::CookieValidation, 300, false);

        let metrics = recorder.metrics(OperationCategory::CookieValidation);
        assert_eq!(metrics.total_attempts, 2);
        assert_eq!(metrics.success_rate, 0.5);
        assert!((metrics.average_operation_time_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(metrics.max_operation_time_ms, 300);
        assert_eq!(metrics.min_operation_time_ms, 100);
        assert!(metrics.last_attempt_time.is_some());
    }

    #[test]
    fn test_consecutive_failures_reset_on_success() {
        let recorder = recorder();
        let category = OperationCategory::MiddlewareCompatibility;

        for _ in 0..5 {
            record_ms(&recorder, category, 10, false);
        }
        assert!(recorder.should_stop_polling(category));
        assert_eq!(recorder.metrics(category).consecutive_failures, 5);

        record_ms(&recorder, category, 10, true);
        let metrics = recorder.metrics(category);
        assert!(!recorder.should_stop_polling(category));
        assert_eq!(metrics.consecutive_failures, 0);
        assert!(metrics.max_consecutive_failures >= 5);
    }

    #[test]
    fn test_counters_stay_consistent() {
        let recorder = recorder();
        let category = OperationCategory::SessionPersistenceSync;
        let pattern = [true, false, false, true, false, true, true, false, false, false];

        for (i, success) in pattern.iter().enumerate() {
            record_ms(&recorder, category, (i as i64 + 1) * 10, *success);
            let metrics = recorder.metrics(category);
            assert_eq!(metrics.success_count + metrics.failure_count, metrics.total_attempts);
            assert_eq!(metrics.total_attempts, i as u64 + 1);
        }
        assert_eq!(recorder.metrics(category).max_consecutive_failures, 3);
    }

    #[test]
    fn test_latency_window_is_bounded_and_recomputed() {
        let recorder = recorder();
        let category = OperationCategory::MiddlewareCompatibility;

        // 1000ms outlier first, then 12 fast probes; window is 10
        record_ms(&recorder, category, 1_000, true);
        for i in 1..=12 {
            record_ms(&recorder, category, i, true);
        }

        let metrics = recorder.metrics(category);
        assert_eq!(metrics.latency_history.len(), 10);
        assert_eq!(metrics.max_operation_time_ms, 12);
        assert_eq!(metrics.min_operation_time_ms, 3);
        assert!((metrics.average_operation_time_ms - 7.5).abs() < f64::EPSILON);
        assert_eq!(metrics.total_attempts, 13);
    }

    #[test]
    fn test_sync_category_keeps_twenty_samples() {
        let recorder = recorder();
        for _ in 0..25 {
            record_ms(&recorder, OperationCategory::SessionPersistenceSync, 5, true);
        }
        assert_eq!(
            recorder.metrics(OperationCategory::SessionPersistenceSync).latency_history.len(),
            20
        );
    }

    #[test]
    fn test_top_errors_sorted_and_capped() {
        let recorder = recorder();
        let category = OperationCategory::CookieGeneration;
        let start = Utc::now();

        for (code, times) in [("timeout", 3), ("session_missing", 5), ("http_503", 1)] {
            for _ in 0..times {
                recorder.record(category, start, start, false, Some(code));
            }
        }

        let top = recorder.top_errors(category, 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0], ErrorPattern { code: "session_missing".into(), count: 5 });
        assert_eq!(top[1], ErrorPattern { code: "timeout".into(), count: 3 });
    }

    #[test]
    fn test_error_patterns_are_bounded() {
        let recorder = recorder();
        let category = OperationCategory::CookieClearing;
        let start = Utc::now();

        for i in 0..(MAX_ERROR_PATTERNS + 10) {
            recorder.record(category, start, start, false, Some(&format!("code_{}", i)));
        }

        let all = recorder.top_errors(category, usize::MAX);
        assert_eq!(all.len(), MAX_ERROR_PATTERNS + 1);
        let overflow = all.iter().find(|p| p.code == OVERFLOW_PATTERN).unwrap();
        assert_eq!(overflow.count, 10);
    }

    #[test]
    fn test_reset_single_category() {
        let recorder = recorder();
        record_ms(&recorder, OperationCategory::CookieValidation, 10, false);
        record_ms(&recorder, OperationCategory::CookieClearing, 10, false);

        recorder.reset(Some(OperationCategory::CookieValidation));

        assert_eq!(recorder.metrics(OperationCategory::CookieValidation).total_attempts, 0);
        assert!(recorder.top_errors(OperationCategory::CookieValidation, 5).is_empty());
        assert_eq!(recorder.metrics(OperationCategory::CookieClearing).total_attempts, 1);

        recorder.reset(None);
        assert_eq!(recorder.metrics(OperationCategory::CookieClearing).total_attempts, 0);
    }

    #[test]
    fn test_effectiveness_tracking() {
        let recorder = recorder();
        let category = OperationCategory::SessionPersistenceSync;
        for i in 0..10 {
            recorder.record_effectiveness(category, i % 4 == 0);
        }

        let stats = recorder.metrics(category).effectiveness;
        assert_eq!(stats.events, 10);
        assert_eq!(stats.effective, 3);
        assert!((stats.rate() - 0.3).abs() < f64::EPSILON);
    }

    #[test_log::test]
    fn test_slow_operation_only_warns() {
        let recorder = recorder();
        let category = OperationCategory::CookieGeneration;
        record_ms(&recorder, category, 5_000, true);

        let metrics = recorder.metrics(category);
        assert_eq!(metrics.total_attempts, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.max_operation_time_ms, 5_000);
    }
}
