//! # Structured Logging
//!
//! Subscriber setup, correlation-ID tracking and the [`LogSink`] seam through
//! which alerts and reports leave the tracker.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter, Registry};
use uuid::Uuid;

use crate::types::{Result, TrackerError};

thread_local! {
    static CORRELATION_ID: RefCell<Option<String>> = RefCell::new(None);
}

tokio::task_local! {
    static TASK_CORRELATION_ID: String;
}

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Verbosity understood by sinks and by the alert engine's level filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(TrackerError::Config(format!("invalid log level '{}'", other))),
        }
    }
}

/// Destination for alert and report messages.
///
/// The tracker never performs its own I/O beyond calling a sink. Errors
/// returned by a sink are logged and swallowed by the caller.
#[cfg_attr(test, mockall::automock)]
pub trait LogSink: Send + Sync {
    fn emit(&self, message: &str, level: LogLevel, context: &serde_json::Value) -> Result<()>;
}

/// Default sink that forwards to `tracing`
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, message: &str, level: LogLevel, context: &serde_json::Value) -> Result<()> {
        match level {
            LogLevel::Debug => tracing::debug!(context = %context, "{}", message),
            LogLevel::Info => tracing::info!(context = %context, "{}", message),
            LogLevel::Warn => tracing::warn!(context = %context, "{}", message),
            LogLevel::Error => tracing::error!(context = %context, "{}", message),
        }
        Ok(())
    }
}

/// Subscriber settings, read from the `logging` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Prefix of the rolling log file
    pub service_name: String,
    pub file_output: bool,
    /// Required for `file_output`
    pub log_dir: Option<String>,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "auth-reliability".to_string(),
            file_output: false,
            log_dir: None,
            json_format: true,
        }
    }
}

/// Initializes the structured logging system.
///
/// Calling this more than once is a no-op.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", config.level)));

    let json_layer = config.json_format.then(|| {
        tracing_fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
    });

    let text_layer = (!config.json_format).then(|| {
        tracing_fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
    });

    let file_layer = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => {
            let appender =
                tracing_appender::rolling::daily(log_dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            // The guard flushes on drop; it has to live as long as the process.
            Box::leak(Box::new(guard));

            Some(tracing_fmt::layer().with_writer(non_blocking).with_ansi(false))
        }
        _ => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| TrackerError::Logging(format!("Failed to set global subscriber: {}", e)))?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Replaces the current thread's correlation ID. Async work should use
/// [`with_correlation_id`] instead, since tasks can migrate between threads.
pub fn set_correlation_id<S: Into<String>>(correlation_id: S) {
    CORRELATION_ID.with(|current| current.replace(Some(correlation_id.into())));
}

pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// The enclosing task's correlation ID, falling back to the thread's
pub fn current_correlation_id() -> Option<String> {
    TASK_CORRELATION_ID
        .try_with(|id| id.clone())
        .ok()
        .or_else(|| CORRELATION_ID.with(|current| current.borrow().clone()))
}

pub fn clear_correlation_id() {
    CORRELATION_ID.with(|current| current.replace(None));
}

/// Runs `future` with `correlation_id` attached to its task
pub async fn with_correlation_id<F, S>(correlation_id: S, future: F) -> F::Output
where
    F: Future,
    S: Into<String>,
{
    TASK_CORRELATION_ID.scope(correlation_id.into(), future).await
}

impl TryFrom<&config::Config> for LoggingConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: &config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = LoggingConfig::default();

        if let Ok(level) = cfg.get::<String>("logging.level") {
            base.level = level;
        }
        if let Ok(service_name) = cfg.get::<String>("logging.service_name") {
            base.service_name = service_name;
        }
        if let Ok(file_output) = cfg.get::<bool>("logging.file_output") {
            base.file_output = file_output;
        }
        if let Ok(log_dir) = cfg.get::<String>("logging.log_dir") {
            base.log_dir = Some(log_dir);
        }
        if let Ok(json_format) = cfg.get::<bool>("logging.json_format") {
            base.json_format = json_format;
        }

        Ok(base)
    }
}
