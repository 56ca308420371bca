//! # Recovery Strategies
//!
//! The immutable table that tells the retry coordinator how many attempts a
//! failure deserves, how long to wait between them and what to do once it
//! gives up. A table is built once and shared behind an `Arc`; lookups never
//! mutate it, so the same (code, category) always yields the same strategy.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{ClassifiedError, ErrorCategory, RecoveryKind};

/// Callback run when a strategy gives up on an operation
pub type FallbackFn = Arc<dyn Fn(&ClassifiedError) + Send + Sync>;

/// How to recover from one class of failure
#[derive(Clone)]
pub struct RecoveryStrategy {
    pub kind: RecoveryKind,
    /// Total attempts allowed, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry; doubled on each further retry
    pub base_delay: Duration,
    pub fallback: Option<FallbackFn>,
}

impl RecoveryStrategy {
    pub fn new(kind: RecoveryKind, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            kind,
            max_attempts,
            base_delay,
            fallback: None,
        }
    }

    /// A strategy that never retries
    pub fn terminal(kind: RecoveryKind) -> Self {
        Self::new(kind, 1, Duration::ZERO)
    }

    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&ClassifiedError) + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Runs the fallback, if one is configured
    pub fn run_fallback(&self, error: &ClassifiedError) {
        if let Some(fallback) = &self.fallback {
            fallback(error);
        }
    }
}

impl fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("kind", &self.kind)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Strategies keyed by error code first, then by category
#[derive(Debug, Clone)]
pub struct StrategyTable {
    by_code: HashMap<String, RecoveryStrategy>,
    by_category: HashMap<ErrorCategory, RecoveryStrategy>,
}

impl StrategyTable {
    /// An empty table; every lookup falls back to [`StrategyTable::default_for`]
    pub fn empty() -> Self {
        Self {
            by_code: HashMap::new(),
            by_category: HashMap::new(),
        }
    }

    /// Registers a strategy for a specific error code
    pub fn with_code<S: Into<String>>(mut self, code: S, strategy: RecoveryStrategy) -> Self {
        self.by_code.insert(code.into(), strategy);
        self
    }

    /// Registers the strategy used for a category when no code matches
    pub fn with_category(mut self, category: ErrorCategory, strategy: RecoveryStrategy) -> Self {
        self.by_category.insert(category, strategy);
        self
    }

    /// Resolves the strategy for a failure. Pure: depends only on the inputs and this table.
    pub fn lookup(&self, code: Option<&str>, category: ErrorCategory) -> RecoveryStrategy {
        code.and_then(|code| self.by_code.get(code))
            .or_else(|| self.by_category.get(&category))
            .cloned()
            .unwrap_or_else(|| Self::default_for(category))
    }

    /// Built-in strategy for a category
    pub fn default_for(category: ErrorCategory) -> RecoveryStrategy {
        match category {
            ErrorCategory::Network => {
                RecoveryStrategy::new(RecoveryKind::Retry, 3, Duration::from_millis(1000))
            }
            ErrorCategory::Timeout => {
                RecoveryStrategy::new(RecoveryKind::Retry, 3, Duration::from_millis(1000))
            }
            ErrorCategory::Session => {
                RecoveryStrategy::new(RecoveryKind::Refresh, 2, Duration::from_millis(500))
            }
            ErrorCategory::Permission => RecoveryStrategy::terminal(RecoveryKind::Redirect),
            ErrorCategory::Unknown => {
                RecoveryStrategy::new(RecoveryKind::Retry, 2, Duration::from_millis(1000))
            }
        }
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self::empty()
            .with_code("invalid_token", RecoveryStrategy::terminal(RecoveryKind::Redirect))
            .with_code(
                "session_missing",
                RecoveryStrategy::new(RecoveryKind::Refresh, 2, Duration::from_millis(500)),
            )
            .with_code(
                "aborted",
                RecoveryStrategy::new(RecoveryKind::Ignore, 1, Duration::ZERO),
            )
    }
}
