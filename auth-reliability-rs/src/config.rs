//! # Configuration
//!
//! Every tunable number of the tracker lives here. Sources, lowest priority
//! first: built-in defaults, an optional config file, then
//! `AUTH_RELIABILITY__*` environment variables (a `.env` file is honoured).

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::{LogLevel, LoggingConfig};
use crate::types::{OperationCategory, Result, TrackerError};

const ENV_PREFIX: &str = "AUTH_RELIABILITY";

/// Alerting and reporting thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Aggregate success rate below which "Low Success Rate" fires
    pub min_success_rate: f64,
    /// Attempts required before the success-rate rule applies
    pub min_sample_size: u64,
    /// Consecutive failures that raise "High Consecutive Failures" and stop polling
    pub max_consecutive_failures: u32,
    /// Per-category latency ceiling in milliseconds
    pub max_operation_time_ms: BTreeMap<OperationCategory, u64>,
    pub reporting_interval_ms: u64,
    /// Lowest level forwarded to the log sink
    pub log_level: LogLevel,
    pub min_effectiveness_rate: f64,
    pub min_effectiveness_events: u64,
    /// Reports kept in history
    pub report_history_limit: usize,
    /// Error codes listed per category in a report
    pub top_error_patterns: usize,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            min_success_rate: 0.8,
            min_sample_size: 10,
            max_consecutive_failures: 5,
            max_operation_time_ms: OperationCategory::ALL
                .iter()
                .map(|category| (*category, Self::default_max_operation_time(*category)))
                .collect(),
            reporting_interval_ms: 60_000,
            log_level: LogLevel::Info,
            min_effectiveness_rate: 0.5,
            min_effectiveness_events: 20,
            report_history_limit: 50,
            top_error_patterns: 5,
        }
    }
}

impl ThresholdConfig {
    fn default_max_operation_time(category: OperationCategory) -> u64 {
        match category {
            OperationCategory::CookieGeneration
            | OperationCategory::CookieValidation
            | OperationCategory::CookieClearing => 500,
            OperationCategory::MiddlewareCompatibility => 1_000,
            OperationCategory::SessionPersistenceSync => 2_000,
        }
    }

    /// Latency ceiling for a category, falling back to the built-in default
    pub fn max_operation_time(&self, category: OperationCategory) -> u64 {
        self.max_operation_time_ms
            .get(&category)
            .copied()
            .unwrap_or_else(|| Self::default_max_operation_time(category))
    }

    pub fn reporting_interval(&self) -> Duration {
        Duration::from_millis(self.reporting_interval_ms)
    }

    /// Merges a partial update into this configuration
    pub fn apply(&mut self, update: ThresholdUpdate) {
        if let Some(value) = update.min_success_rate {
            self.min_success_rate = value;
        }
        if let Some(value) = update.min_sample_size {
            self.min_sample_size = value;
        }
        if let Some(value) = update.max_consecutive_failures {
            self.max_consecutive_failures = value;
        }
        self.max_operation_time_ms.extend(update.max_operation_time_ms);
        if let Some(value) = update.reporting_interval_ms {
            self.reporting_interval_ms = value;
        }
        if let Some(value) = update.log_level {
            self.log_level = value;
        }
        if let Some(value) = update.min_effectiveness_rate {
            self.min_effectiveness_rate = value;
        }
        if let Some(value) = update.min_effectiveness_events {
            self.min_effectiveness_events = value;
        }
        if let Some(value) = update.report_history_limit {
            self.report_history_limit = value;
        }
        if let Some(value) = update.top_error_patterns {
            self.top_error_patterns = value;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return Err(TrackerError::Config(format!(
                "min_success_rate must be within [0, 1], got {}",
                self.min_success_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.min_effectiveness_rate) {
            return Err(TrackerError::Config(format!(
                "min_effectiveness_rate must be within [0, 1], got {}",
                self.min_effectiveness_rate
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(TrackerError::Config(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if self.reporting_interval_ms == 0 {
            return Err(TrackerError::Config(
                "reporting_interval_ms must be positive".to_string(),
            ));
        }
        if self.report_history_limit == 0 {
            return Err(TrackerError::Config(
                "report_history_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads `AUTH_RELIABILITY_*` variables over the defaults
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let mut base = Self::default();

        if let Some(value) = env_parse("AUTH_RELIABILITY_MIN_SUCCESS_RATE") {
            base.min_success_rate = value;
        }
        if let Some(value) = env_parse("AUTH_RELIABILITY_MIN_SAMPLE_SIZE") {
            base.min_sample_size = value;
        }
        if let Some(value) = env_parse("AUTH_RELIABILITY_MAX_CONSECUTIVE_FAILURES") {
            base.max_consecutive_failures = value;
        }
        if let Some(value) = env_parse("AUTH_RELIABILITY_REPORTING_INTERVAL_MS") {
            base.reporting_interval_ms = value;
        }
        if let Some(value) = std::env::var("AUTH_RELIABILITY_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            base.log_level = value;
        }
        for category in OperationCategory::ALL {
            let key = format!(
                "AUTH_RELIABILITY_MAX_{}_MS",
                category.as_str().to_ascii_uppercase()
            );
            if let Some(value) = env_parse(&key) {
                base.max_operation_time_ms.insert(category, value);
            }
        }

        base
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// A partial threshold change applied at runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdUpdate {
    pub min_success_rate: Option<f64>,
    pub min_sample_size: Option<u64>,
    pub max_consecutive_failures: Option<u32>,
    pub max_operation_time_ms: BTreeMap<OperationCategory, u64>,
    pub reporting_interval_ms: Option<u64>,
    pub log_level: Option<LogLevel>,
    pub min_effectiveness_rate: Option<f64>,
    pub min_effectiveness_events: Option<u64>,
    pub report_history_limit: Option<usize>,
    pub top_error_patterns: Option<usize>,
}

/// Backoff shape shared by every retry the coordinator schedules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Upper bound for a single backoff delay
    pub max_backoff_ms: u64,
    /// Jitter factor (0.0 - 1.0) applied symmetrically to each delay
    pub jitter_factor: f64,
    /// Whether to emit `metrics` counters for retries
    pub record_metrics: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_backoff_ms: 10_000,
            jitter_factor: 0.0,
            record_metrics: true,
        }
    }
}

impl RetryConfig {
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Everything needed to construct a monitor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub thresholds: ThresholdConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    /// Defaults overridden by `AUTH_RELIABILITY_*` variables
    pub fn from_env() -> Self {
        Self {
            thresholds: ThresholdConfig::from_env(),
            ..Default::default()
        }
    }

    /// Layers an optional config file and `AUTH_RELIABILITY__SECTION__KEY` variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let config = MonitorConfig::try_from(&cfg)?;
        config.thresholds.validate()?;
        Ok(config)
    }
}

impl TryFrom<&config::Config> for ThresholdConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: &config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = ThresholdConfig::default();

        if let Ok(value) = cfg.get::<f64>("thresholds.min_success_rate") {
            base.min_success_rate = value;
        }
        if let Ok(value) = cfg.get::<u64>("thresholds.min_sample_size") {
            base.min_sample_size = value;
        }
        if let Ok(value) = cfg.get::<u32>("thresholds.max_consecutive_failures") {
            base.max_consecutive_failures = value;
        }
        if let Ok(value) = cfg.get::<u64>("thresholds.reporting_interval_ms") {
            base.reporting_interval_ms = value;
        }
        if let Ok(value) = cfg.get::<String>("thresholds.log_level") {
            base.log_level = value
                .parse()
                .map_err(|e: TrackerError| config::ConfigError::Message(e.to_string()))?;
        }
        if let Ok(value) = cfg.get::<f64>("thresholds.min_effectiveness_rate") {
            base.min_effectiveness_rate = value;
        }
        if let Ok(value) = cfg.get::<u64>("thresholds.min_effectiveness_events") {
            base.min_effectiveness_events = value;
        }
        if let Ok(value) = cfg.get::<usize>("thresholds.report_history_limit") {
            base.report_history_limit = value;
        }
        if let Ok(value) = cfg.get::<usize>("thresholds.top_error_patterns") {
            base.top_error_patterns = value;
        }
        if let Ok(map) = cfg.get::<HashMap<String, u64>>("thresholds.max_operation_time_ms") {
            for (name, value) in map {
                let category: OperationCategory = name
                    .parse()
                    .map_err(|e: TrackerError| config::ConfigError::Message(e.to_string()))?;
                base.max_operation_time_ms.insert(category, value);
            }
        }

        Ok(base)
    }
}

impl TryFrom<&config::Config> for RetryConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: &config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = RetryConfig::default();

        if let Ok(value) = cfg.get::<u64>("retry.max_backoff_ms") {
            base.max_backoff_ms = value;
        }
        if let Ok(value) = cfg.get::<f64>("retry.jitter_factor") {
            base.jitter_factor = value.clamp(0.0, 1.0);
        }
        if let Ok(value) = cfg.get::<bool>("retry.record_metrics") {
            base.record_metrics = value;
        }

        Ok(base)
    }
}

impl TryFrom<&config::Config> for MonitorConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: &config::Config) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            thresholds: ThresholdConfig::try_from(cfg)?,
            retry: RetryConfig::try_from(cfg)?,
            logging: LoggingConfig::try_from(cfg)?,
        })
    }
}
