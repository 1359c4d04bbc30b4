//! Error types for the tasuki runtime.
//!
//! Errors are grouped by concern: tool failures stay inside step results,
//! provider failures flow through the reliability manager, queue failures
//! surface through the queue API, and rate-limit exhaustion carries a
//! machine-readable code.

use thiserror::Error;

/// A type alias for `Result<T, TasukiError>`.
pub type Result<T> = std::result::Result<T, TasukiError>;

/// Discriminating code attached to a rate-limit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitCode {
    /// The per-window call budget was exhausted.
    Calls,
    /// The per-window token budget was exhausted.
    Tokens,
}

impl RateLimitCode {
    /// Get the wire representation of the code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Calls => "RATE_LIMIT_CALLS",
            Self::Tokens => "RATE_LIMIT_TOKENS",
        }
    }
}

impl std::fmt::Display for RateLimitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rate limit was exceeded; the triggering rule and budget are named.
#[derive(Debug, Clone, Error)]
#[error("Rate limit exceeded: {rule} ({code})")]
pub struct RateLimitError {
    /// Name of the rule that rejected the usage.
    pub rule: String,
    /// Which budget was exhausted.
    pub code: RateLimitCode,
}

impl RateLimitError {
    /// Create a new rate-limit error for the named rule.
    #[must_use]
    pub fn new(rule: impl Into<String>, code: RateLimitCode) -> Self {
        Self {
            rule: rule.into(),
            code,
        }
    }
}

/// A normalized LLM transport failure.
///
/// Provider clients map their wire errors onto this shape so the reliability
/// manager can decide whether a retry is worthwhile.
#[derive(Debug, Clone, Error)]
#[error("Provider error {status_code} ({code}): {message}")]
pub struct ProviderError {
    /// HTTP status code reported by the provider, 0 when unknown.
    pub status_code: u16,
    /// Provider-specific error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the reliability manager should retry this failure.
    pub retriable: bool,
}

impl ProviderError {
    /// Normalize a transport failure from its HTTP status code.
    ///
    /// Statuses 408, 409, 429 and the 5xx gateway family are retriable.
    #[must_use]
    pub fn from_status(status_code: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        let retriable = matches!(status_code, 408 | 409 | 429 | 500 | 502 | 503 | 504);
        Self {
            status_code,
            code: code.into(),
            message: message.into(),
            retriable,
        }
    }

    /// Create a non-retriable error with no transport status.
    #[must_use]
    pub fn terminal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status_code: 0,
            code: code.into(),
            message: message.into(),
            retriable: false,
        }
    }
}

/// Errors raised by queue backends and the durable queue worker.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The storage backend failed.
    #[error("Queue backend error: {0}")]
    Backend(String),

    /// A payload or job row could not be (de)serialized.
    #[error("Queue serialization error: {0}")]
    Serialization(String),

    /// The job exhausted its attempt budget and was dead-lettered.
    #[error("Job failed after {attempts} attempts: {error}")]
    JobFailed {
        /// Last handler error.
        error: String,
        /// Attempts consumed.
        attempts: u32,
    },

    /// The queue was stopped while a submission was still pending.
    #[error("Queue worker stopped before the job completed")]
    WorkerStopped,
}

/// The main error type for runtime operations.
#[derive(Debug, Error)]
pub enum TasukiError {
    /// A tool invocation failed.
    #[error("Tool error in '{tool_name}': {message}")]
    Tool {
        /// Name of the tool that failed.
        tool_name: String,
        /// The underlying error message.
        message: String,
    },

    /// The named tool is not registered.
    #[error("Tool '{tool_name}' not found")]
    ToolNotFound {
        /// Name that failed to resolve.
        tool_name: String,
    },

    /// A governance policy denied the action.
    #[error("{0}")]
    PolicyDenied(String),

    /// A rate limit rejected the usage.
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    /// A normalized provider failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The circuit breaker for a key is open.
    #[error("Circuit breaker open for {key}")]
    CircuitOpen {
        /// Breaker key, usually a tool or model name.
        key: String,
    },

    /// Model output or a wire payload could not be parsed.
    #[error("Parsing error: {message}")]
    Parsing {
        /// The parsing error message.
        message: String,
    },

    /// A durable queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Filesystem or embedded database failure.
    #[error("Storage error: {message}")]
    Storage {
        /// The underlying error message.
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration issue.
        message: String,
    },

    /// Generic internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// The underlying error message.
        message: String,
    },
}

impl TasukiError {
    /// Create a new tool execution error.
    #[must_use]
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Create a new tool-not-found error.
    #[must_use]
    pub fn tool_not_found(tool_name: impl Into<String>) -> Self {
        Self::ToolNotFound {
            tool_name: tool_name.into(),
        }
    }

    /// Create a new parsing error.
    #[must_use]
    pub fn parsing(message: impl Into<String>) -> Self {
        Self::Parsing {
            message: message.into(),
        }
    }

    /// Create a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the reliability manager may retry the failed operation.
    ///
    /// Policy denials, rate limits and open breakers are never retried;
    /// provider failures follow their normalized `retriable` flag.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Provider(e) => e.retriable,
            Self::PolicyDenied(_) | Self::RateLimit(_) | Self::CircuitOpen { .. } => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_code_wire_format() {
        assert_eq!(RateLimitCode::Calls.as_str(), "RATE_LIMIT_CALLS");
        assert_eq!(RateLimitCode::Tokens.as_str(), "RATE_LIMIT_TOKENS");
    }

    #[test]
    fn provider_error_retriable_statuses() {
        for status in [408, 409, 429, 500, 502, 503, 504] {
            assert!(
                ProviderError::from_status(status, "err", "msg").retriable,
                "{status} should be retriable"
            );
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(
                !ProviderError::from_status(status, "err", "msg").retriable,
                "{status} should not be retriable"
            );
        }
    }

    #[test]
    fn circuit_open_message_names_the_key() {
        let err = TasukiError::CircuitOpen {
            key: "llm:gpt-4".into(),
        };
        assert_eq!(err.to_string(), "Circuit breaker open for llm:gpt-4");
    }

    #[test]
    fn retriability_classification() {
        assert!(!TasukiError::PolicyDenied("denied".into()).is_retriable());
        assert!(!TasukiError::from(RateLimitError::new("r", RateLimitCode::Calls)).is_retriable());
        assert!(!TasukiError::CircuitOpen { key: "k".into() }.is_retriable());
        assert!(TasukiError::tool("t", "boom").is_retriable());
        assert!(TasukiError::from(ProviderError::from_status(503, "e", "m")).is_retriable());
        assert!(!TasukiError::from(ProviderError::from_status(401, "e", "m")).is_retriable());
    }
}
