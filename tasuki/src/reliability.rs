//! Reliability primitives: retry with backoff, circuit breaking, replay.
//!
//! The [`ReliabilityManager`] composes a retry policy with a per-key circuit
//! breaker. Both a synchronous and an asynchronous execution path are
//! provided; the async path sleeps cooperatively via `tokio::time`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{error, warn};

use crate::error::{Result, TasukiError};

/// Retry behavior for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_retries: u32,
    /// Initial delay between attempts.
    pub base_delay: Duration,
    /// Ceiling on the computed delay.
    pub max_delay: Duration,
    /// Base for exponential growth (2.0 doubles each attempt).
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following the given zero-based attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.exponential_base.powi(attempt as i32);
        let delay = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerPolicy {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before the next probe.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-key breaker state.
#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn allow(&mut self, policy: &CircuitBreakerPolicy) -> bool {
        match self.opened_at {
            None => true,
            Some(opened_at) => {
                if opened_at.elapsed() >= policy.reset_timeout {
                    // Reset; the next call probes the half-open circuit.
                    self.opened_at = None;
                    self.failures = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.failures = 0;
        self.opened_at = None;
    }

    fn record_failure(&mut self, policy: &CircuitBreakerPolicy) {
        self.failures += 1;
        if self.failures >= policy.failure_threshold {
            self.opened_at = Some(Instant::now());
        }
    }
}

/// Cache of recorded step outputs for deterministic replay.
///
/// When a context runs in replay mode, the executor consults this store
/// before invoking a tool and returns the cached value as a successful step
/// result.
#[derive(Debug, Default)]
pub struct ReplayStore {
    data: Mutex<HashMap<String, Value>>,
}

impl ReplayStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with recorded values.
    #[must_use]
    pub fn with_data(data: HashMap<String, Value>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// Look up a recorded value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Record a value under the key, replacing any previous entry.
    pub fn record(&self, key: impl Into<String>, value: Value) {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value);
    }
}

/// Composes a retry policy with a per-key circuit breaker.
#[derive(Debug, Default)]
pub struct ReliabilityManager {
    retry_policy: RetryPolicy,
    breaker_policy: CircuitBreakerPolicy,
    breakers: Mutex<HashMap<String, BreakerState>>,
}

impl ReliabilityManager {
    /// Create a manager from its policies.
    #[must_use]
    pub fn new(retry_policy: RetryPolicy, breaker_policy: CircuitBreakerPolicy) -> Self {
        Self {
            retry_policy,
            breaker_policy,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// The configured retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    fn check_breaker(&self, key: &str) -> Result<()> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let state = breakers.entry(key.to_owned()).or_default();
        if state.allow(&self.breaker_policy) {
            Ok(())
        } else {
            Err(TasukiError::CircuitOpen {
                key: key.to_owned(),
            })
        }
    }

    fn record_outcome(&self, key: &str, success: bool) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let state = breakers.entry(key.to_owned()).or_default();
        if success {
            state.record_success();
        } else {
            state.record_failure(&self.breaker_policy);
        }
    }

    /// Whether the breaker for the key is currently open.
    #[must_use]
    pub fn is_open(&self, key: &str) -> bool {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        !breakers
            .entry(key.to_owned())
            .or_default()
            .allow(&self.breaker_policy)
    }

    /// Run an operation under the breaker and retry policy, synchronously.
    ///
    /// Non-retriable failures (policy denials, rate limits, terminal
    /// provider errors) propagate without further attempts.
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` when the breaker rejects the call, otherwise
    /// the last failure once retries are exhausted.
    pub fn execute<T>(&self, key: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        self.check_breaker(key)?;

        let policy = self.retry_policy;
        let mut last_error = None;
        for attempt in 0..policy.max_retries.max(1) {
            match op() {
                Ok(value) => {
                    self.record_outcome(key, true);
                    return Ok(value);
                }
                Err(err) => {
                    let retriable = err.is_retriable();
                    if attempt + 1 < policy.max_retries && retriable {
                        let delay = policy.delay_for_attempt(attempt);
                        warn!(
                            key,
                            attempt = attempt + 1,
                            max = policy.max_retries,
                            error = %err,
                            "attempt failed, retrying after {delay:?}"
                        );
                        last_error = Some(err);
                        std::thread::sleep(delay);
                    } else {
                        if retriable {
                            error!(key, max = policy.max_retries, error = %err, "all retry attempts failed");
                        }
                        self.record_outcome(key, false);
                        return Err(err);
                    }
                }
            }
        }

        self.record_outcome(key, false);
        Err(last_error.unwrap_or_else(|| TasukiError::internal("max retries exceeded")))
    }

    /// Run an async operation under the breaker and retry policy.
    ///
    /// Sleeps between attempts cooperatively.
    ///
    /// # Errors
    ///
    /// Same contract as [`ReliabilityManager::execute`].
    pub async fn execute_async<T, F, Fut>(&self, key: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check_breaker(key)?;

        let policy = self.retry_policy;
        let mut last_error = None;
        for attempt in 0..policy.max_retries.max(1) {
            match op().await {
                Ok(value) => {
                    self.record_outcome(key, true);
                    return Ok(value);
                }
                Err(err) => {
                    let retriable = err.is_retriable();
                    if attempt + 1 < policy.max_retries && retriable {
                        let delay = policy.delay_for_attempt(attempt);
                        warn!(
                            key,
                            attempt = attempt + 1,
                            max = policy.max_retries,
                            error = %err,
                            "attempt failed, retrying after {delay:?}"
                        );
                        last_error = Some(err);
                        tokio::time::sleep(delay).await;
                    } else {
                        if retriable {
                            error!(key, max = policy.max_retries, error = %err, "all retry attempts failed");
                        }
                        self.record_outcome(key, false);
                        return Err(err);
                    }
                }
            }
        }

        self.record_outcome(key, false);
        Err(last_error.unwrap_or_else(|| TasukiError::internal("max retries exceeded")))
    }
}
