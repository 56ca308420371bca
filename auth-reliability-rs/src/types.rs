//! # Core Types
//!
//! Operation categories, the classified-error taxonomy and the crate-level
//! error type shared by every component of the tracker.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A type alias for Result with the error type defaulting to [`TrackerError`]
pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// Failures of the tracker itself (configuration, logging setup, sinks).
///
/// Failures of *tracked* operations are never reported through this type;
/// they surface as [`ClassifiedError`].
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging initialization error: {0}")]
    Logging(String),

    #[error("Log sink error: {0}")]
    Sink(String),

    #[error("Unknown operation category: {0}")]
    UnknownCategory(String),

    #[error("Unknown trend metric: {0}")]
    UnknownMetric(String),

    #[error("Metrics exporter error: {0}")]
    Exporter(String),
}

impl From<config::ConfigError> for TrackerError {
    fn from(err: config::ConfigError) -> Self {
        TrackerError::Config(err.to_string())
    }
}

/// Identifies which rolling-metrics bucket and threshold set apply to an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    CookieGeneration,
    CookieValidation,
    CookieClearing,
    MiddlewareCompatibility,
    SessionPersistenceSync,
}

impl OperationCategory {
    /// Every category, in a stable order
    pub const ALL: [OperationCategory; 5] = [
        OperationCategory::CookieGeneration,
        OperationCategory::CookieValidation,
        OperationCategory::CookieClearing,
        OperationCategory::MiddlewareCompatibility,
        OperationCategory::SessionPersistenceSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationCategory::CookieGeneration => "cookie_generation",
            OperationCategory::CookieValidation => "cookie_validation",
            OperationCategory::CookieClearing => "cookie_clearing",
            OperationCategory::MiddlewareCompatibility => "middleware_compatibility",
            OperationCategory::SessionPersistenceSync => "session_persistence_sync",
        }
    }

    /// Capacity of the latency FIFO kept for this category
    pub fn latency_window(&self) -> usize {
        match self {
            OperationCategory::SessionPersistenceSync => 20,
            _ => 10,
        }
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationCategory {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        OperationCategory::ALL
            .iter()
            .copied()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| TrackerError::UnknownCategory(s.to_string()))
    }
}

/// Error taxonomy produced by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connectivity, fetch or transport failures
    Network,
    /// Expired, invalid or missing session or token
    Session,
    /// Unauthorized or forbidden
    Permission,
    /// Explicit operation timeout
    Timeout,
    /// Anything the classifier could not place
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Session => "session",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller should do once retries are exhausted or skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    Retry,
    Redirect,
    Refresh,
    Ignore,
}

impl fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryKind::Retry => write!(f, "retry"),
            RecoveryKind::Redirect => write!(f, "redirect"),
            RecoveryKind::Refresh => write!(f, "refresh"),
            RecoveryKind::Ignore => write!(f, "ignore"),
        }
    }
}

/// A raw failure normalized into the fixed taxonomy with retry metadata.
///
/// `message` is the only field that is safe to render to an end user.
/// `code` and `category` exist for programmatic branching, and `detail`
/// carries the sanitized original message for logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {message}")]
pub struct ClassifiedError {
    /// A unique identifier for this failure instance
    pub id: Uuid,
    /// Taxonomy bucket
    pub category: ErrorCategory,
    /// User-facing message
    pub message: String,
    /// Sanitized original message
    pub detail: String,
    /// Error code, when the failure carried or implied one
    pub code: Option<String>,
    /// Whether retrying can plausibly succeed
    pub retryable: bool,
    /// Recovery strategy applied to this failure
    pub recovery: RecoveryKind,
    /// Attempts made before this error was surfaced
    pub attempts: u32,
    /// Set when a pending retry was cancelled before it could run
    pub superseded: bool,
    /// Correlation ID for request tracing
    pub correlation_id: Option<String>,
    /// When the failure was classified
    pub timestamp: DateTime<Utc>,
}

impl ClassifiedError {
    /// Creates a classified error with the category's default recovery kind
    pub fn new<S: Into<String>>(category: ErrorCategory, message: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            message: message.into(),
            detail: String::new(),
            code: None,
            retryable: true,
            recovery: RecoveryKind::Retry,
            attempts: 0,
            superseded: false,
            correlation_id: crate::logging::current_correlation_id(),
            timestamp: Utc::now(),
        }
    }

    pub fn detail<S: Into<String>>(mut self, detail: S) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn recovery(mut self, recovery: RecoveryKind) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Marks this error as the result of a cancelled pending retry
    pub fn superseded(mut self) -> Self {
        self.superseded = true;
        self
    }

    /// The key used in error-pattern frequency maps
    pub fn pattern_key(&self) -> String {
        self.code
            .clone()
            .unwrap_or_else(|| self.category.as_str().to_string())
    }
}

/// One timed invocation of a tracked operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationAttempt {
    pub category: OperationCategory,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success: bool,
    pub error_code: Option<String>,
}

impl OperationAttempt {
    /// Elapsed milliseconds, clamped at zero for clock skew
    pub fn duration_ms(&self) -> u64 {
        (self.end_time - self.start_time).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trip_through_str() {
        for category in OperationCategory::ALL {
            let parsed: OperationCategory = category.as_str().parse().unwrap();
            assert_eq!(parsed, category);
        }
        assert!("cookie_eating".parse::<OperationCategory>().is_err());
    }

    #[test]
    fn test_latency_windows() {
        assert_eq!(OperationCategory::MiddlewareCompatibility.latency_window(), 10);
        assert_eq!(OperationCategory::CookieValidation.latency_window(), 10);
        assert_eq!(OperationCategory::SessionPersistenceSync.latency_window(), 20);
    }

    #[test]
    fn test_classified_error_display_uses_user_message() {
        let err = ClassifiedError::new(ErrorCategory::Session, "Your session has expired")
            .detail("refresh_token_not_found: token abc")
            .code("session_expired");

        let display = format!("{}", err);
        assert!(display.contains("session"));
        assert!(display.contains("Your session has expired"));
        assert!(!display.contains("abc"));
        assert_eq!(err.pattern_key(), "session_expired");
    }

    #[test]
    fn test_attempt_duration_clamps_negative() {
        let now = Utc::now();
        let attempt = OperationAttempt {
            category: OperationCategory::CookieClearing,
            start_time: now,
            end_time: now - chrono::Duration::milliseconds(5),
            success: true,
            error_code: None,
        };
        assert_eq!(attempt.duration_ms(), 0);
    }
}
