//! # Retry Coordination
//!
//! Runs tracked operations with classification, keyed attempt counters and
//! exponential backoff. Only one retry timer may be pending per key: a newer
//! failure for the same key cancels the older timer, and the caller that was
//! waiting on it returns a `superseded` error instead of retrying.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::classifier::{ErrorClassifier, RawFailure};
use crate::config::RetryConfig;
use crate::recorder::MetricsRecorder;
use crate::schedule::{DelayOutcome, PendingDelay, ScheduledTask};
use crate::sync::lock;
use crate::types::{ClassifiedError, OperationCategory, Result};

/// Per-call overrides for [`RetryCoordinator::execute_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Replaces the strategy's `max_attempts`
    pub max_attempts: Option<u32>,
    /// Replaces the strategy's `base_delay`
    pub base_delay: Option<Duration>,
    /// Time box applied to every individual attempt
    pub attempt_timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = Some(base_delay);
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }
}

/// Builds the conventional attempt key for an operation on a subject
pub fn attempt_key(operation: &str, subject: &str) -> String {
    format!("{}_{}", operation, subject)
}

/// Races a future against a timeout. Expiry surfaces as a `TimeoutError`
/// raw failure and is classified like any other error.
pub async fn with_timeout<Fut, T, E>(timeout: Duration, future: Fut) -> Result<T, RawFailure>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<RawFailure>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(RawFailure::timeout(timeout)),
    }
}

async fn run_attempt<Fut, T, E>(timeout: Option<Duration>, future: Fut) -> Result<T, RawFailure>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<RawFailure>,
{
    match timeout {
        Some(timeout) => with_timeout(timeout, future).await,
        None => future.await.map_err(Into::into),
    }
}

/// Executes operations under the recovery strategy of their failures
pub struct RetryCoordinator {
    classifier: ErrorClassifier,
    recorder: Arc<MetricsRecorder>,
    config: RetryConfig,
    attempts: Mutex<HashMap<String, u32>>,
    pending: Mutex<HashMap<String, ScheduledTask>>,
}

impl std::fmt::Debug for RetryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryCoordinator")
            .field("config", &self.config)
            .field("pending", &lock(&self.pending).len())
            .finish()
    }
}

/// Clears a key's retry state when an `execute` future is dropped mid-backoff
struct AbandonGuard<'a> {
    coordinator: &'a RetryCoordinator,
    key: &'a str,
    task_id: u64,
    armed: bool,
}

impl<'a> AbandonGuard<'a> {
    fn new(coordinator: &'a RetryCoordinator, key: &'a str, task_id: u64) -> Self {
        Self {
            coordinator,
            key,
            task_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.abandon(self.key, self.task_id);
        }
    }
}

impl RetryCoordinator {
    pub fn new(classifier: ErrorClassifier, recorder: Arc<MetricsRecorder>, config: RetryConfig) -> Self {
        Self {
            classifier,
            recorder,
            config,
            attempts: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Runs `operation` with the strategy defaults for whatever it fails with
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
        self.execute_with(key, category, ExecuteOptions::default(), operation)
            .await
    }

    /// Runs `operation`, retrying retryable failures until the attempt budget
    /// for `key` is spent. Only the terminal attempt is recorded.
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        key: &str,
        category: OperationCategory,
        options: ExecuteOptions,
        mut operation: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<RawFailure>,
    {
        loop {
            let start_time = Utc::now();
            let result = run_attempt(options.attempt_timeout, operation()).await;
            let end_time = Utc::now();

            let raw = match result {
                Ok(value) => {
                    let previous = lock(&self.attempts).remove(key).unwrap_or(0);
                    if previous > 0 {
                        info!(key = %key, category = %category, retries = previous, "Operation succeeded after retries");
                    }
                    self.recorder.record(category, start_time, end_time, true, None);
                    return Ok(value);
                }
                Err(raw) => raw,
            };

            let error = self.classifier.classify(raw);
            let strategy = self.classifier.strategy_for(&error);

            if !error.retryable {
                let attempts = lock(&self.attempts).remove(key).unwrap_or(0) + 1;
                let error = error.attempts(attempts);
                debug!(key = %key, category = %category, error = %error, "Non-retryable failure");
                strategy.run_fallback(&error);
                self.record_failure(category, start_time, end_time, &error);
                return Err(error);
            }

            let attempt = self.bump_attempt(key);
            let max_attempts = options.max_attempts.unwrap_or(strategy.max_attempts);
            let error = error.attempts(attempt);

            if attempt >= max_attempts {
                lock(&self.attempts).remove(key);
                warn!(
                    key = %key,
                    category = %category,
                    attempts = attempt,
                    error = %error,
                    "Giving up after retries"
                );
                if self.config.record_metrics {
                    counter!("auth_reliability_retry_exhausted_total", 1, "category" => category.as_str());
                }
                strategy.run_fallback(&error);
                self.record_failure(category, start_time, end_time, &error);
                return Err(error);
            }

            let delay = self.calculate_backoff(options.base_delay.unwrap_or(strategy.base_delay), attempt);
            debug!(
                key = %key,
                category = %category,
                attempt = attempt,
                max_attempts = max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after error"
            );
            if self.config.record_metrics {
                counter!("auth_reliability_retries_total", 1, "category" => category.as_str());
            }

            let (task_id, pending) = self.schedule(key, delay);
            let guard = AbandonGuard::new(self, key, task_id);
            let outcome = pending.wait().await;
            guard.disarm();
            match outcome {
                DelayOutcome::Elapsed => self.finish_pending(key, task_id),
                DelayOutcome::Cancelled => {
                    debug!(key = %key, category = %category, "Pending retry superseded");
                    return Err(error.superseded());
                }
            }
        }
    }

    /// Runs a single, optionally time-boxed attempt and records it
    pub async fn timed_execute<F, Fut, T, E>(
        &self,
        category: OperationCategory,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<RawFailure>,
    {
        let start_time = Utc::now();
        let result = run_attempt(timeout, operation()).await;
        let end_time = Utc::now();

        match result {
            Ok(value) => {
                self.recorder.record(category, start_time, end_time, true, None);
                Ok(value)
            }
            Err(raw) => {
                let error = self.classifier.classify(raw).attempts(1);
                self.record_failure(category, start_time, end_time, &error);
                Err(error)
            }
        }
    }

    /// `min(base * 2^(attempt-1), max_backoff)` with optional symmetric jitter
    pub fn calculate_backoff(&self, base_delay: Duration, attempt: u32) -> Duration {
        let base_ms = base_delay.as_millis() as f64;
        let max_ms = self.config.max_backoff().as_millis() as f64;

        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let capped = (base_ms * 2.0_f64.powi(exponent)).min(max_ms);

        let jitter_range = capped * self.config.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).clamp(0.0, max_ms) as u64)
    }

    /// Attempts counted so far for a key
    pub fn attempt_count(&self, key: &str) -> u32 {
        lock(&self.attempts).get(key).copied().unwrap_or(0)
    }

    pub fn pending_retries(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Cancels every pending retry and forgets every attempt counter
    pub fn clear_all(&self) {
        let drained: Vec<ScheduledTask> = lock(&self.pending).drain().map(|(_, task)| task).collect();
        let cancelled = drained.len();
        for task in drained {
            task.cancel();
        }
        lock(&self.attempts).clear();
        debug!(cancelled = cancelled, "Cleared retry state");
    }

    fn bump_attempt(&self, key: &str) -> u32 {
        let mut attempts = lock(&self.attempts);
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn schedule(&self, key: &str, delay: Duration) -> (u64, PendingDelay) {
        let (task, pending) = ScheduledTask::delay(delay);
        let id = task.id();
        let previous = lock(&self.pending).insert(key.to_string(), task);
        if let Some(previous) = previous {
            previous.cancel();
        }
        (id, pending)
    }

    fn finish_pending(&self, key: &str, task_id: u64) {
        let mut pending = lock(&self.pending);
        if pending.get(key).map(ScheduledTask::id) == Some(task_id) {
            pending.remove(key);
        }
    }

    /// Forgets the key's retry state if `task_id` is still its pending timer
    fn abandon(&self, key: &str, task_id: u64) {
        let mut pending = lock(&self.pending);
        if pending.get(key).map(ScheduledTask::id) != Some(task_id) {
            return;
        }
        if let Some(task) = pending.remove(key) {
            task.cancel();
        }
        lock(&self.attempts).remove(key);
        debug!(key = %key, "Retry abandoned by caller");
    }

    fn record_failure(
        &self,
        category: OperationCategory,
        start_time: chrono::DateTime<Utc>,
        end_time: chrono::DateTime<Utc>,
        error: &ClassifiedError,
    ) {
        let code = error.pattern_key();
        self.recorder.record(category, start_time, end_time, false, Some(&code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::RwLock;

    use crate::config::ThresholdConfig;
    use crate::strategy::{RecoveryStrategy, StrategyTable};
    use crate::types::{ErrorCategory, RecoveryKind};

    fn recorder() -> Arc<MetricsRecorder> {
        Arc::new(MetricsRecorder::new(Arc::new(RwLock::new(ThresholdConfig::default()))))
    }

    fn coordinator_with(classifier: ErrorClassifier) -> (Arc<RetryCoordinator>, Arc<MetricsRecorder>) {
        let recorder = recorder();
        let coordinator = RetryCoordinator::new(classifier, recorder.clone(), RetryConfig::default());
        (Arc::new(coordinator), recorder)
    }

    fn coordinator() -> (Arc<RetryCoordinator>, Arc<MetricsRecorder>) {
        coordinator_with(ErrorClassifier::default())
    }

    fn fetch_failure() -> RawFailure {
        RawFailure::named("AuthRetryableFetchError", "fetch failed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_is_capped_then_starts_fresh() {
        let (coordinator, recorder) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let category = OperationCategory::SessionPersistenceSync;

        let counter = calls.clone();
        let result: Result<(), ClassifiedError> = coordinator
            .execute("sync_user-1", category, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(fetch_failure()) }
            })
            .await;

        let error = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(error.category, ErrorCategory::Network);
        assert_eq!(error.attempts, 3);
        assert!(!error.superseded);
        assert_eq!(coordinator.attempt_count("sync_user-1"), 0);

        let metrics = recorder.metrics(category);
        assert_eq!(metrics.total_attempts, 1);
        assert_eq!(metrics.failure_count, 1);

        let counter = calls.clone();
        let again: Result<(), ClassifiedError> = coordinator
            .execute("sync_user-1", category, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(fetch_failure()) }
            })
            .await;
        assert_eq!(again.unwrap_err().attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_attempts() {
        let (coordinator, _) = coordinator();
        let started = tokio::time::Instant::now();

        let _ = coordinator
            .execute("probe_a", OperationCategory::MiddlewareCompatibility, || async {
                Err::<(), _>(fetch_failure())
            })
            .await;

        // 1000ms + 2000ms between the three attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3_000));
        assert!(elapsed < Duration::from_millis(3_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failure_clears_counter() {
        let (coordinator, recorder) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = coordinator
            .execute("validate_abc", OperationCategory::CookieValidation, || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(RawFailure::new("network request failed"))
                    } else {
                        Ok("valid")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "valid");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.attempt_count("validate_abc"), 0);
        let metrics = recorder.metrics(OperationCategory::CookieValidation);
        assert_eq!(metrics.total_attempts, 1);
        assert_eq!(metrics.success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_rejects_immediately_and_runs_fallback() {
        let redirected = Arc::new(AtomicBool::new(false));
        let flag = redirected.clone();
        let table = StrategyTable::default().with_code(
            "invalid_token",
            RecoveryStrategy::terminal(RecoveryKind::Redirect)
                .with_fallback(move |_| flag.store(true, Ordering::SeqCst)),
        );
        let (coordinator, recorder) = coordinator_with(ErrorClassifier::new(Arc::new(table)));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), ClassifiedError> = coordinator
            .execute("refresh_u1", OperationCategory::CookieGeneration, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RawFailure::named("AuthInvalidTokenResponseError", "bad token")) }
            })
            .await;

        let error = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!error.retryable);
        assert_eq!(error.recovery, RecoveryKind::Redirect);
        assert!(redirected.load(Ordering::SeqCst));
        assert_eq!(recorder.metrics(OperationCategory::CookieGeneration).failure_count, 1);
        assert_eq!(
            recorder.top_errors(OperationCategory::CookieGeneration, 1)[0].code,
            "invalid_token"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_retry_supersedes_pending_one() {
        let (coordinator, recorder) = coordinator();
        let category = OperationCategory::SessionPersistenceSync;

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .execute("sync_user-2", category, || async { Err::<(), _>(fetch_failure()) })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(coordinator.pending_retries(), 1);

        let second: Result<(), ClassifiedError> = coordinator
            .execute("sync_user-2", category, || async { Err::<(), _>(fetch_failure()) })
            .await;

        let superseded = first.await.unwrap().unwrap_err();
        assert!(superseded.superseded);
        assert_eq!(superseded.attempts, 1);

        let second = second.unwrap_err();
        assert!(!second.superseded);
        assert_eq!(second.attempts, 3);

        // only the superseding call is recorded
        assert_eq!(recorder.metrics(category).total_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_releases_its_retry_state() {
        let (coordinator, _) = coordinator();
        let category = OperationCategory::CookieValidation;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(500),
            coordinator.execute("validate_u7", category, || async { Err::<(), _>(fetch_failure()) }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(coordinator.attempt_count("validate_u7"), 0);
        assert_eq!(coordinator.pending_retries(), 0);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), ClassifiedError> = coordinator
            .execute("validate_u7", category, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(fetch_failure()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_superseded_call_keeps_newer_state() {
        let (coordinator, _) = coordinator();
        let category = OperationCategory::SessionPersistenceSync;

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .execute("sync_user-9", category, || async { Err::<(), _>(fetch_failure()) })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .execute("sync_user-9", category, || async { Err::<(), _>(fetch_failure()) })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(first.await.unwrap().unwrap_err().superseded);
        assert_eq!(coordinator.attempt_count("sync_user-9"), 2);
        assert_eq!(coordinator.pending_retries(), 1);

        assert_eq!(second.await.unwrap().unwrap_err().attempts, 3);
        assert_eq!(coordinator.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_carry_task_correlation_id() {
        let (coordinator, _) = coordinator();

        let result: Result<(), ClassifiedError> = crate::logging::with_correlation_id(
            "req-cookie-42",
            coordinator.timed_execute(OperationCategory::CookieGeneration, None, || async {
                Err::<(), _>(RawFailure::new("fetch failed"))
            }),
        )
        .await;

        assert_eq!(result.unwrap_err().correlation_id.as_deref(), Some("req-cookie-42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_cancels_pending_retries() {
        let (coordinator, recorder) = coordinator();
        let waiting = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .execute("probe_b", OperationCategory::MiddlewareCompatibility, || async {
                        Err::<(), _>(fetch_failure())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(coordinator.attempt_count("probe_b"), 1);

        coordinator.clear_all();

        let error = waiting.await.unwrap().unwrap_err();
        assert!(error.superseded);
        assert_eq!(coordinator.attempt_count("probe_b"), 0);
        assert_eq!(coordinator.pending_retries(), 0);
        assert_eq!(
            recorder.metrics(OperationCategory::MiddlewareCompatibility).total_attempts,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_execute_times_out() {
        let (coordinator, recorder) = coordinator();

        let result: Result<(), ClassifiedError> = coordinator
            .timed_execute(OperationCategory::CookieClearing, Some(Duration::from_millis(100)), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), RawFailure>(())
            })
            .await;

        let error = result.unwrap_err();
        assert_eq!(error.category, ErrorCategory::Timeout);
        assert_eq!(error.attempts, 1);

        let metrics = recorder.metrics(OperationCategory::CookieClearing);
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(recorder.top_errors(OperationCategory::CookieClearing, 1)[0].code, "timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_options_override_attempts_and_time_box_each_attempt() {
        let (coordinator, _) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let options = ExecuteOptions::default()
            .max_attempts(2)
            .base_delay(Duration::from_millis(10))
            .attempt_timeout(Duration::from_millis(50));

        let result: Result<(), ClassifiedError> = coordinator
            .execute_with("gen_c", OperationCategory::CookieGeneration, options, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<(), RawFailure>(())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.unwrap_err().category, ErrorCategory::Timeout);
    }

    #[test]
    fn test_calculate_backoff_is_capped() {
        let (coordinator, _) = coordinator();
        let base = Duration::from_millis(1_000);

        assert_eq!(coordinator.calculate_backoff(base, 1), Duration::from_millis(1_000));
        assert_eq!(coordinator.calculate_backoff(base, 2), Duration::from_millis(2_000));
        assert_eq!(coordinator.calculate_backoff(base, 3), Duration::from_millis(4_000));
        assert_eq!(coordinator.calculate_backoff(base, 5), Duration::from_secs(10));
        assert_eq!(coordinator.calculate_backoff(base, 40), Duration::from_secs(10));
    }

    #[test]
    fn test_jittered_backoff_stays_in_range() {
        let config = RetryConfig {
            jitter_factor: 0.5,
            ..Default::default()
        };
        let coordinator = RetryCoordinator::new(ErrorClassifier::default(), recorder(), config);

        for _ in 0..50 {
            let delay = coordinator.calculate_backoff(Duration::from_millis(1_000), 2);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(3_000));
        }
    }

    #[test]
    fn test_attempt_key_format() {
        assert_eq!(attempt_key("session_sync", "user-42"), "session_sync_user-42");
    }
}
