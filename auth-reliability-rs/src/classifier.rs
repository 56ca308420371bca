//! # Error Classification
//!
//! Turns any raw failure into a [`ClassifiedError`]. Classification is pure:
//! it depends only on the failure and the static name/keyword tables plus the
//! strategy table handed in at construction.
//!
//! Order of precedence:
//! 1. exact match on the failure's name against well-known auth failure names
//! 2. HTTP status, when the failure carries one
//! 3. case-insensitive keyword search over the message, network first, then
//!    session, then permission
//! 4. `unknown`, retryable

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::sanitization::sanitize_message;
use crate::strategy::{RecoveryStrategy, StrategyTable};
use crate::types::{ClassifiedError, ErrorCategory};

const NETWORK_MESSAGE: &str = "A network error occurred. Please check your connection and try again.";
const SESSION_MESSAGE: &str = "Your session has expired. Please sign in again.";
const PERMISSION_MESSAGE: &str = "You do not have permission to perform this action.";
const TIMEOUT_MESSAGE: &str = "The request took too long to complete. Please try again.";
const UNKNOWN_MESSAGE: &str = "An unexpected error occurred. Please try again later.";

/// A failure as produced by a wrapped operation, before classification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFailure {
    /// Error type name, e.g. `AuthSessionMissingError`
    pub name: Option<String>,
    pub message: String,
    pub code: Option<String>,
    /// HTTP status, when the failure came from an HTTP exchange
    pub status: Option<u16>,
}

impl RawFailure {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn named<N: Into<String>, S: Into<String>>(name: N, message: S) -> Self {
        Self {
            name: Some(name.into()),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// The distinguished failure produced when an operation is time-boxed and loses the race
    pub fn timeout(after: Duration) -> Self {
        Self::named(
            "TimeoutError",
            format!("operation timed out after {}ms", after.as_millis()),
        )
    }

    /// Builds a raw failure from any error value. Known error types found in
    /// the source chain keep their timeout, network and status information.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut source = Some(err);
        while let Some(current) = source {
            if let Some(err) = current.downcast_ref::<reqwest::Error>() {
                return Self::from_reqwest(err);
            }
            if let Some(err) = current.downcast_ref::<std::io::Error>() {
                return Self::from_io(err);
            }
            if current.is::<tokio::time::error::Elapsed>() {
                return Self::named("TimeoutError", current.to_string());
            }
            source = current.source();
        }
        Self::new(err.to_string())
    }

    fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::named("TimeoutError", err.to_string()),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => {
                Self::new(format!("network connection failed: {}", err))
            }
            std::io::ErrorKind::PermissionDenied => Self::new(format!("permission denied: {}", err)),
            _ => Self::new(err.to_string()),
        }
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        let raw = if err.is_timeout() {
            Self::named("TimeoutError", err.to_string())
        } else if err.is_connect() || err.is_request() {
            Self::new(format!("network request failed: {}", err))
        } else {
            Self::new(err.to_string())
        };

        match err.status() {
            Some(status) => raw.with_status(status.as_u16()),
            None => raw,
        }
    }
}

impl From<&str> for RawFailure {
    fn from(message: &str) -> Self {
        RawFailure::new(message)
    }
}

impl From<String> for RawFailure {
    fn from(message: String) -> Self {
        RawFailure::new(message)
    }
}

impl From<std::io::Error> for RawFailure {
    fn from(err: std::io::Error) -> Self {
        RawFailure::from_io(&err)
    }
}

impl From<reqwest::Error> for RawFailure {
    fn from(err: reqwest::Error) -> Self {
        RawFailure::from_reqwest(&err)
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for RawFailure {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        RawFailure::from_error(&*err)
    }
}

impl From<anyhow::Error> for RawFailure {
    fn from(err: anyhow::Error) -> Self {
        RawFailure::from_error(&*err)
    }
}

impl From<tokio::time::error::Elapsed> for RawFailure {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        RawFailure::named("TimeoutError", err.to_string())
    }
}

/// A well-known failure name and what it means
struct KnownFailure {
    name: &'static str,
    category: ErrorCategory,
    retryable: bool,
    message: &'static str,
    code: &'static str,
}

static KNOWN_FAILURES: &[KnownFailure] = &[
    KnownFailure {
        name: "AuthSessionMissingError",
        category: ErrorCategory::Session,
        retryable: true,
        message: "No active session was found. Please sign in.",
        code: "session_missing",
    },
    KnownFailure {
        name: "AuthRetryableFetchError",
        category: ErrorCategory::Network,
        retryable: true,
        message: NETWORK_MESSAGE,
        code: "retryable_fetch",
    },
    KnownFailure {
        name: "AuthInvalidTokenResponseError",
        category: ErrorCategory::Session,
        retryable: false,
        message: "Your sign-in token is no longer valid. Please sign in again.",
        code: "invalid_token",
    },
    KnownFailure {
        name: "TimeoutError",
        category: ErrorCategory::Timeout,
        retryable: true,
        message: TIMEOUT_MESSAGE,
        code: "timeout",
    },
    KnownFailure {
        name: "AbortError",
        category: ErrorCategory::Timeout,
        retryable: true,
        message: "The request was cancelled before it completed.",
        code: "aborted",
    },
];

const NETWORK_KEYWORDS: &[&str] = &[
    "network",
    "fetch",
    "connection",
    "econnrefused",
    "econnreset",
    "enotfound",
    "offline",
    "dns",
    "socket",
    "timed out",
    "timeout",
];

const SESSION_KEYWORDS: &[&str] = &[
    "session",
    "expired",
    "jwt",
    "token",
    "refresh",
    "not authenticated",
];

const PERMISSION_KEYWORDS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "permission",
    "access denied",
    "not allowed",
];

/// Bare 401/403 status codes quoted in a message
static PERMISSION_STATUS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b40[13]\b").expect("valid status pattern"));

/// Maps raw failures onto the error taxonomy
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    strategies: Arc<StrategyTable>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(Arc::new(StrategyTable::default()))
    }
}

impl ErrorClassifier {
    pub fn new(strategies: Arc<StrategyTable>) -> Self {
        Self { strategies }
    }

    pub fn strategies(&self) -> &Arc<StrategyTable> {
        &self.strategies
    }

    /// Classifies a failure. Never fails; unplaceable input becomes `unknown`.
    pub fn classify<F: Into<RawFailure>>(&self, failure: F) -> ClassifiedError {
        let raw = failure.into();

        let (category, retryable, message, code) = Self::categorize(&raw);

        let mut classified = ClassifiedError::new(category, message)
            .detail(sanitize_message(&raw.message))
            .retryable(retryable);
        if let Some(code) = code {
            classified = classified.code(code);
        }

        let strategy = self.strategy_for(&classified);
        classified.recovery(strategy.kind)
    }

    /// Strategy that applies to an already classified failure
    pub fn strategy_for(&self, error: &ClassifiedError) -> RecoveryStrategy {
        self.strategies.lookup(error.code.as_deref(), error.category)
    }

    fn categorize(raw: &RawFailure) -> (ErrorCategory, bool, &'static str, Option<String>) {
        if let Some(name) = raw.name.as_deref() {
            if let Some(known) = KNOWN_FAILURES.iter().find(|known| known.name == name) {
                let code = raw.code.clone().unwrap_or_else(|| known.code.to_string());
                return (known.category, known.retryable, known.message, Some(code));
            }
        }

        if let Some(status) = raw.status {
            let code = raw.code.clone().or_else(|| Some(format!("http_{}", status)));
            match status {
                401 | 403 => return (ErrorCategory::Permission, false, PERMISSION_MESSAGE, code),
                408 | 504 => return (ErrorCategory::Timeout, true, TIMEOUT_MESSAGE, code),
                500..=599 => return (ErrorCategory::Network, true, NETWORK_MESSAGE, code),
                _ => {}
            }
        }

        let message = raw.message.to_lowercase();
        let code = raw.code.clone();

        if contains_any(&message, NETWORK_KEYWORDS) {
            (ErrorCategory::Network, true, NETWORK_MESSAGE, code)
        } else if contains_any(&message, SESSION_KEYWORDS) {
            (ErrorCategory::Session, true, SESSION_MESSAGE, code)
        } else if contains_any(&message, PERMISSION_KEYWORDS)
            || PERMISSION_STATUS_PATTERN.is_match(&message)
        {
            (ErrorCategory::Permission, false, PERMISSION_MESSAGE, code)
        } else {
            (ErrorCategory::Unknown, true, UNKNOWN_MESSAGE, code)
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}
