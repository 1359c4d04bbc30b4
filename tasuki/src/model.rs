//! Model selection and generation parameters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Configuration for the active LLM selection.
///
/// `name` is the logical name used for rate-limit scoping and metrics;
/// `model_id` is the provider-specific identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Logical model name, used as the rate-limit and metrics key.
    pub name: String,
    /// Provider name (`openai`, `anthropic`, `azure`, `mock`, ...).
    pub provider: String,
    /// Provider-specific model identifier.
    pub model_id: String,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Maximum tokens to generate.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Provider-specific extras passed through untouched.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

const fn default_temperature() -> f32 {
    0.2
}

const fn default_max_tokens() -> u32 {
    1024
}

impl ModelConfig {
    /// Create a config with default generation parameters.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            model_id: model_id.into(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            extra: HashMap::new(),
        }
    }

    /// Set the sampling temperature (builder pattern).
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the generation token cap (builder pattern).
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Attach a provider-specific extra (builder pattern).
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}
