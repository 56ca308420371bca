//! # Auth Reliability
//!
//! Reliability tracking for authentication operations such as cookie
//! generation and validation, middleware compatibility probes and session
//! persistence sync.
//!
//! ## Features
//!
//! - Classification of raw failures into a closed taxonomy with user-safe messages
//! - Keyed retries with exponential backoff and cancellable pending timers
//! - Rolling per-category metrics with bounded latency windows
//! - Deduplicated, auto-resolving threshold alerts
//! - Periodic performance reports with bounded history and trends
//! - Structured logging with correlation IDs and Prometheus export
//!

pub mod alerts;
pub mod classifier;
pub mod config;
pub mod logging;
pub mod monitor;
pub mod recorder;
pub mod reporting;
pub mod retry;
pub mod sanitization;
pub mod schedule;
pub mod strategy;
pub mod telemetry;
pub mod types;

mod sync;

// Re-export commonly used types
pub use alerts::{Alert, AlertEngine, AlertKey, AlertSeverity};
pub use classifier::{ErrorClassifier, RawFailure};
pub use config::{MonitorConfig, RetryConfig, ThresholdConfig, ThresholdUpdate};
pub use logging::{init_logging, LogLevel, LogSink, LoggingConfig, TracingSink};
pub use monitor::{global, install_global, uninstall_global, AuthReliabilityMonitor};
pub use recorder::{MetricsRecorder, RollingMetrics};
pub use reporting::{PerformanceReport, ReportAggregator, TrendMetric};
pub use retry::{attempt_key, with_timeout, ExecuteOptions, RetryCoordinator};
pub use strategy::{RecoveryStrategy, StrategyTable};
pub use types::{
    ClassifiedError, ErrorCategory, OperationCategory, RecoveryKind, Result, TrackerError,
};

/// Initializes logging and builds a monitor from layered configuration
pub fn init_with_config(path: Option<&str>) -> Result<AuthReliabilityMonitor> {
    let config = MonitorConfig::load(path)?;
    init_logging(Some(config.logging.clone()))?;
    AuthReliabilityMonitor::new(config)
}
