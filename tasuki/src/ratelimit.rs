//! Sliding-window rate limiting over calls and tokens.
//!
//! Rules are scoped per model, agent, tenant, or globally. A single mutex
//! guards all histories; a check either records the usage for every rule
//! atomically or fails without recording anything.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RateLimitCode, RateLimitError};

/// What a rule's counters are keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    /// One counter per model name.
    Model,
    /// One counter per agent name.
    Agent,
    /// One counter per tenant.
    Tenant,
    /// A single shared counter.
    Global,
}

/// A single rate-limit rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Rule name, echoed in rejection errors.
    pub name: String,
    /// Maximum calls per window, if limited.
    pub max_calls: Option<u32>,
    /// Maximum tokens per window, if limited.
    pub max_tokens: Option<u64>,
    /// Window length in seconds.
    pub window_seconds: u64,
    /// What the counters are keyed on.
    pub scope: RateLimitScope,
}

impl RateLimitRule {
    /// Create a rule with a 60 second window and no budgets.
    #[must_use]
    pub fn new(name: impl Into<String>, scope: RateLimitScope) -> Self {
        Self {
            name: name.into(),
            max_calls: None,
            max_tokens: None,
            window_seconds: 60,
            scope,
        }
    }

    /// Cap calls per window (builder pattern).
    #[must_use]
    pub const fn with_max_calls(mut self, max_calls: u32) -> Self {
        self.max_calls = Some(max_calls);
        self
    }

    /// Cap tokens per window (builder pattern).
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the window length in seconds (builder pattern).
    #[must_use]
    pub const fn with_window_seconds(mut self, window_seconds: u64) -> Self {
        self.window_seconds = window_seconds;
        self
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    fn key(&self, agent: &str, model: &str, tenant: &str) -> String {
        match self.scope {
            RateLimitScope::Model => format!("model:{model}"),
            RateLimitScope::Agent => format!("agent:{agent}"),
            RateLimitScope::Tenant => format!("tenant:{tenant}"),
            RateLimitScope::Global => "global".to_owned(),
        }
    }
}

#[derive(Debug, Default)]
struct Histories {
    calls: HashMap<String, VecDeque<Instant>>,
    tokens: HashMap<String, VecDeque<(Instant, u64)>>,
}

/// Sliding-window limiter over calls and tokens.
///
/// Shared across agents; all mutation happens under one internal mutex so a
/// check is atomic with respect to concurrent callers.
#[derive(Debug)]
pub struct RateLimiter {
    rules: Vec<RateLimitRule>,
    histories: Mutex<Histories>,
}

impl RateLimiter {
    /// Create a limiter from its rules.
    #[must_use]
    pub fn new(rules: Vec<RateLimitRule>) -> Self {
        Self {
            rules,
            histories: Mutex::new(Histories::default()),
        }
    }

    /// The configured rules.
    #[must_use]
    pub fn rules(&self) -> &[RateLimitRule] {
        &self.rules
    }

    /// Check all rules for this usage and record it if every rule admits it.
    ///
    /// Expired entries are evicted first. If any rule rejects, nothing is
    /// recorded and the first violation is returned; otherwise the call and
    /// token usage is appended to every rule's history.
    ///
    /// # Errors
    ///
    /// Returns a [`RateLimitError`] naming the violated rule and budget.
    pub fn check(
        &self,
        agent: &str,
        model: &str,
        tokens: u64,
        tenant: &str,
    ) -> Result<(), RateLimitError> {
        let now = Instant::now();
        let mut histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());

        for rule in &self.rules {
            let key = rule.key(agent, model, tenant);
            let window = rule.window();

            let calls = histories.calls.entry(key.clone()).or_default();
            while calls
                .front()
                .is_some_and(|t| now.duration_since(*t) > window)
            {
                calls.pop_front();
            }
            let calls_in_window = calls.len();

            let token_entries = histories.tokens.entry(key).or_default();
            while token_entries
                .front()
                .is_some_and(|(t, _)| now.duration_since(*t) > window)
            {
                token_entries.pop_front();
            }
            let tokens_in_window: u64 = token_entries.iter().map(|(_, t)| *t).sum();

            if let Some(max_calls) = rule.max_calls
                && calls_in_window as u32 >= max_calls
            {
                warn!(rule = %rule.name, used = calls_in_window, max = max_calls, "rate limit exceeded (calls)");
                return Err(RateLimitError::new(&rule.name, RateLimitCode::Calls));
            }

            if let Some(max_tokens) = rule.max_tokens
                && tokens_in_window + tokens > max_tokens
            {
                warn!(rule = %rule.name, used = tokens_in_window + tokens, max = max_tokens, "rate limit exceeded (tokens)");
                return Err(RateLimitError::new(&rule.name, RateLimitCode::Tokens));
            }
        }

        for rule in &self.rules {
            let key = rule.key(agent, model, tenant);
            histories.calls.entry(key.clone()).or_default().push_back(now);
            histories
                .tokens
                .entry(key)
                .or_default()
                .push_back((now, tokens));
        }

        Ok(())
    }

    /// Calls currently recorded in the window of the given rule and key.
    #[must_use]
    pub fn recorded_calls(&self, rule_name: &str, agent: &str, model: &str, tenant: &str) -> usize {
        let histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        self.rules
            .iter()
            .find(|r| r.name == rule_name)
            .and_then(|rule| histories.calls.get(&rule.key(agent, model, tenant)))
            .map_or(0, VecDeque::len)
    }

    /// Tokens currently recorded in the window of the given rule and key.
    #[must_use]
    pub fn recorded_tokens(&self, rule_name: &str, agent: &str, model: &str, tenant: &str) -> u64 {
        let histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        self.rules
            .iter()
            .find(|r| r.name == rule_name)
            .and_then(|rule| histories.tokens.get(&rule.key(agent, model, tenant)))
            .map_or(0, |entries| entries.iter().map(|(_, t)| *t).sum())
    }

    /// Drop all recorded history.
    pub fn reset(&self) {
        let mut histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        histories.calls.clear();
        histories.tokens.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_rule(max_calls: u32) -> RateLimitRule {
        RateLimitRule::new("calls", RateLimitScope::Model).with_max_calls(max_calls)
    }

    fn token_rule(max_tokens: u64) -> RateLimitRule {
        RateLimitRule::new("tokens", RateLimitScope::Model).with_max_tokens(max_tokens)
    }

    mod call_budget {
        use super::*;

        #[test]
        fn allows_up_to_the_limit() {
            let limiter = RateLimiter::new(vec![call_rule(3)]);
            for _ in 0..3 {
                limiter.check("a", "m", 0, "default").unwrap();
            }
            let err = limiter.check("a", "m", 0, "default").unwrap_err();
            assert_eq!(err.code, RateLimitCode::Calls);
            assert_eq!(err.rule, "calls");
        }

        #[test]
        fn rejection_does_not_record() {
            let limiter = RateLimiter::new(vec![call_rule(1)]);
            limiter.check("a", "m", 0, "default").unwrap();
            let _ = limiter.check("a", "m", 0, "default").unwrap_err();
            assert_eq!(limiter.recorded_calls("calls", "a", "m", "default"), 1);
        }

        #[test]
        fn scopes_are_independent() {
            let limiter = RateLimiter::new(vec![call_rule(1)]);
            limiter.check("a", "model-1", 0, "default").unwrap();
            // Different model, different counter under model scope.
            limiter.check("a", "model-2", 0, "default").unwrap();
            assert!(limiter.check("a", "model-1", 0, "default").is_err());
        }

        #[test]
        fn agent_scope_keys_on_agent() {
            let rule = RateLimitRule::new("per-agent", RateLimitScope::Agent).with_max_calls(1);
            let limiter = RateLimiter::new(vec![rule]);
            limiter.check("alice", "m", 0, "default").unwrap();
            limiter.check("bob", "m", 0, "default").unwrap();
            assert!(limiter.check("alice", "m", 0, "default").is_err());
        }
    }

    mod token_budget {
        use super::*;

        #[test]
        fn token_accounting_persists_after_rejection() {
            let limiter = RateLimiter::new(vec![token_rule(10)]);
            limiter.check("a", "m", 6, "default").unwrap();
            let err = limiter.check("a", "m", 5, "default").unwrap_err();
            assert_eq!(err.code, RateLimitCode::Tokens);
            assert_eq!(limiter.recorded_tokens("tokens", "a", "m", "default"), 6);
        }

        #[test]
        fn last_fitting_call_succeeds_next_fails() {
            let limiter = RateLimiter::new(vec![token_rule(10)]);
            limiter.check("a", "m", 6, "default").unwrap();
            limiter.check("a", "m", 4, "default").unwrap();
            assert!(limiter.check("a", "m", 1, "default").is_err());
        }
    }

    mod window {
        use super::*;

        #[test]
        fn expired_entries_are_evicted() {
            // Zero-length window: every prior entry is already expired.
            let rule = call_rule(1).with_window_seconds(0);
            let limiter = RateLimiter::new(vec![rule]);
            limiter.check("a", "m", 0, "default").unwrap();
            std::thread::sleep(Duration::from_millis(5));
            limiter.check("a", "m", 0, "default").unwrap();
        }

        #[test]
        fn first_call_after_expiry_succeeds() {
            let rule = RateLimitRule::new("w", RateLimitScope::Global)
                .with_max_calls(1)
                .with_window_seconds(1);
            let limiter = RateLimiter::new(vec![rule]);
            limiter.check("a", "m", 0, "default").unwrap();
            assert!(limiter.check("a", "m", 0, "default").is_err());
            std::thread::sleep(Duration::from_millis(1100));
            limiter.check("a", "m", 0, "default").unwrap();
        }
    }

    mod concurrency {
        use super::*;
        use std::sync::Arc;

        #[test]
        fn exactly_the_budget_succeeds_under_contention() {
            let limiter = Arc::new(RateLimiter::new(vec![call_rule(20)]));
            let mut handles = Vec::new();
            for _ in 0..40 {
                let limiter = Arc::clone(&limiter);
                handles.push(std::thread::spawn(move || {
                    limiter.check("a", "m", 0, "default").is_ok()
                }));
            }
            let successes = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count();
            assert_eq!(successes, 20);
            assert_eq!(limiter.recorded_calls("calls", "a", "m", "default"), 20);
        }

        #[test]
        fn all_requests_within_budget_succeed() {
            let limiter = Arc::new(RateLimiter::new(vec![call_rule(100)]));
            let mut handles = Vec::new();
            for _ in 0..50 {
                let limiter = Arc::clone(&limiter);
                handles.push(std::thread::spawn(move || {
                    limiter.check("a", "m", 1, "default").is_ok()
                }));
            }
            assert!(handles.into_iter().all(|h| h.join().unwrap()));
        }
    }
}
