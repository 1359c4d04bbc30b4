//! LLM client abstraction.
//!
//! Concrete HTTP provider clients live outside this crate; the runtime only
//! depends on the [`LlmClient`] contract and the normalized
//! [`ProviderError`](crate::error::ProviderError) shape they produce.
//! [`MockLlmClient`] echoes the last user message and is what every
//! end-to-end test runs against.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::ModelConfig;

/// A single prompt message handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    /// Conversation role (`system`, `user`, `assistant`).
    pub role: String,
    /// Message content.
    pub content: String,
}

impl PromptMessage {
    /// Create a system prompt message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    /// Create a user prompt message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Response from a provider generation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Generated text.
    pub text: String,
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u64,
    /// Tokens produced by the completion.
    pub completion_tokens: u64,
    /// Total tokens for the call.
    pub total_tokens: u64,
}

/// Estimate token usage as the whitespace-split word count across messages.
///
/// This is the pre-flight estimate handed to the rate limiter; providers
/// report exact counts after the fact.
#[must_use]
pub fn estimate_tokens(messages: &[PromptMessage]) -> u64 {
    messages
        .iter()
        .map(|m| m.content.split_whitespace().count() as u64)
        .sum()
}

/// The contract every LLM provider client satisfies.
///
/// Transport failures must be normalized to
/// [`ProviderError`](crate::error::ProviderError) so the reliability manager
/// can classify them as retriable or terminal.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion for the given prompt.
    ///
    /// # Errors
    ///
    /// Returns a normalized provider error when the call fails.
    fn generate(&self, messages: &[PromptMessage], config: &ModelConfig) -> Result<LlmResponse>;

    /// Asynchronous variant of [`LlmClient::generate`].
    ///
    /// The default implementation runs the synchronous path inline, which is
    /// adequate for in-process clients; HTTP-backed providers override this
    /// with a genuinely asynchronous call.
    async fn generate_async(
        &self,
        messages: &[PromptMessage],
        config: &ModelConfig,
    ) -> Result<LlmResponse> {
        self.generate(messages, config)
    }
}

/// A deterministic in-process client for tests and dry runs.
///
/// Echoes the last message prefixed with the logical model name and counts
/// whitespace-separated words as tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    /// Create a new mock client.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn generate(&self, messages: &[PromptMessage], config: &ModelConfig) -> Result<LlmResponse> {
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        let text = format!("[{}] {last}", config.name);
        let prompt_tokens = estimate_tokens(messages);
        let completion_tokens = text.split_whitespace().count() as u64;
        Ok(LlmResponse {
            total_tokens: prompt_tokens + completion_tokens,
            text,
            prompt_tokens,
            completion_tokens,
        })
    }
}

/// A client that replays a fixed sequence of responses, cycling at the end.
///
/// Useful for driving the planner through specific outputs, valid or not.
#[derive(Debug)]
pub struct ScriptedLlmClient {
    responses: Vec<String>,
    cursor: std::sync::atomic::AtomicUsize,
}

impl ScriptedLlmClient {
    /// Create a client that cycles through the given responses.
    #[must_use]
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            cursor: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn generate(&self, messages: &[PromptMessage], _config: &ModelConfig) -> Result<LlmResponse> {
        let index = self
            .cursor
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let text = if self.responses.is_empty() {
            String::new()
        } else {
            self.responses[index % self.responses.len()].clone()
        };
        let prompt_tokens = estimate_tokens(messages);
        let completion_tokens = text.split_whitespace().count() as u64;
        Ok(LlmResponse {
            total_tokens: prompt_tokens + completion_tokens,
            text,
            prompt_tokens,
            completion_tokens,
        })
    }
}
