//! Per-agent mutable state.
//!
//! An [`AgentContext`] holds the message history, the tool map, the model
//! selection, and the optional collaborators (event bus, rate limiter,
//! observability, reliability, policy, replay). Collaborators are strongly
//! typed optional fields; the open `config` bag remains for anything else.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::message::{META_RUN_ID, META_SESSION_ID, Message};
use crate::model::ModelConfig;
use crate::observability::{EventBus, ObservabilityManager};
use crate::policy::PolicyEngine;
use crate::ratelimit::RateLimiter;
use crate::reliability::{ReliabilityManager, ReplayStore};
use crate::tool::{Tool, ToolRegistry};

/// Default bound on the short-term history.
pub const DEFAULT_MAX_SHORT_TERM: usize = 1000;
/// Default bound on the long-term history.
pub const DEFAULT_MAX_LONG_TERM: usize = 10_000;

/// Per-agent mutable state: history, tools, model, collaborators.
#[derive(Debug)]
pub struct AgentContext {
    /// Recent messages, newest at the back. Bounded by `max_short_term`.
    pub short_term: VecDeque<Message>,
    /// Archived messages evicted from short-term. Bounded by `max_long_term`.
    pub long_term: VecDeque<Message>,
    /// Tools available to the agent, keyed by unique name.
    pub tools: HashMap<String, Tool>,
    /// Active model selection.
    pub model_config: Option<ModelConfig>,
    /// Event bus for structured observability events.
    pub events: Option<EventBus>,
    /// Shared rate limiter.
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Session this context currently belongs to.
    pub session_id: Option<String>,
    /// Run this context currently belongs to.
    pub run_id: Option<String>,
    /// Unified tracing and metrics.
    pub observability: Option<Arc<ObservabilityManager>>,
    /// Retry and circuit-breaker wrapper for outbound calls.
    pub reliability: Option<Arc<ReliabilityManager>>,
    /// Governance policy checks for tool calls.
    pub policy_engine: Option<Arc<PolicyEngine>>,
    /// Recorded step outputs for deterministic replay.
    pub replay_store: Option<Arc<ReplayStore>>,
    /// When set, the executor consults the replay store before tools.
    pub replay_mode: bool,
    /// Organization this context acts for, used by policy checks.
    pub org_id: Option<String>,
    /// Open key/value bag for anything without a typed field.
    pub config: HashMap<String, Value>,
    max_short_term: usize,
    max_long_term: usize,
}

impl Default for AgentContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentContext {
    /// Create a context with default bounds and no collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self {
            short_term: VecDeque::new(),
            long_term: VecDeque::new(),
            tools: HashMap::new(),
            model_config: None,
            events: None,
            rate_limiter: None,
            session_id: None,
            run_id: None,
            observability: None,
            reliability: None,
            policy_engine: None,
            replay_store: None,
            replay_mode: false,
            org_id: None,
            config: HashMap::new(),
            max_short_term: DEFAULT_MAX_SHORT_TERM,
            max_long_term: DEFAULT_MAX_LONG_TERM,
        }
    }

    /// Override the history bounds (builder pattern).
    ///
    /// Bounds are clamped to at least one message.
    #[must_use]
    pub fn with_memory_bounds(mut self, max_short_term: usize, max_long_term: usize) -> Self {
        self.max_short_term = max_short_term.max(1);
        self.max_long_term = max_long_term.max(1);
        self
    }

    /// Set the model selection (builder pattern).
    #[must_use]
    pub fn with_model_config(mut self, model_config: ModelConfig) -> Self {
        self.model_config = Some(model_config);
        self
    }

    /// Attach an event bus (builder pattern).
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Attach a rate limiter (builder pattern).
    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Attach an observability manager (builder pattern).
    #[must_use]
    pub fn with_observability(mut self, observability: Arc<ObservabilityManager>) -> Self {
        self.observability = Some(observability);
        self
    }

    /// Attach a reliability manager (builder pattern).
    #[must_use]
    pub fn with_reliability(mut self, reliability: Arc<ReliabilityManager>) -> Self {
        self.reliability = Some(reliability);
        self
    }

    /// Attach a policy engine (builder pattern).
    #[must_use]
    pub fn with_policy_engine(mut self, policy_engine: Arc<PolicyEngine>) -> Self {
        self.policy_engine = Some(policy_engine);
        self
    }

    /// Attach a replay store and enable replay mode (builder pattern).
    #[must_use]
    pub fn with_replay(mut self, replay_store: Arc<ReplayStore>) -> Self {
        self.replay_store = Some(replay_store);
        self.replay_mode = true;
        self
    }

    /// Set the acting organization (builder pattern).
    #[must_use]
    pub fn with_org_id(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    /// Populate the tool map from a registry (builder pattern).
    #[must_use]
    pub fn with_tools(mut self, registry: &ToolRegistry) -> Self {
        self.tools = registry.tools().clone();
        self
    }

    /// Register a single tool. A tool with the same name is replaced.
    pub fn register_tool(&mut self, tool: Tool) {
        self.tools.insert(tool.name.clone(), tool);
    }

    /// The short-term history bound.
    #[must_use]
    pub const fn max_short_term(&self) -> usize {
        self.max_short_term
    }

    /// The long-term history bound.
    #[must_use]
    pub const fn max_long_term(&self) -> usize {
        self.max_long_term
    }

    /// Append a message to short-term history.
    ///
    /// On overflow the oldest short-term message moves into long-term
    /// history, which silently drops its own oldest entry when full. Both
    /// bounds hold after every call.
    pub fn add_short_term_message(&mut self, message: Message) {
        self.short_term.push_back(message);
        while self.short_term.len() > self.max_short_term {
            if let Some(evicted) = self.short_term.pop_front() {
                self.long_term.push_back(evicted);
            }
        }
        while self.long_term.len() > self.max_long_term {
            self.long_term.pop_front();
        }
    }

    /// Update the run context used to stamp future messages.
    pub fn set_run_context(&mut self, session_id: impl Into<String>, run_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
        self.run_id = Some(run_id.into());
    }

    /// Stamp `session_id` and `run_id` into the message metadata.
    ///
    /// Existing stamps are never overwritten: once a message carries run
    /// metadata it keeps it for life.
    pub fn apply_run_metadata(&self, message: &mut Message) {
        if let Some(session_id) = &self.session_id
            && !message.metadata.contains_key(META_SESSION_ID)
        {
            message
                .metadata
                .insert(META_SESSION_ID.to_owned(), Value::String(session_id.clone()));
        }
        if let Some(run_id) = &self.run_id
            && !message.metadata.contains_key(META_RUN_ID)
        {
            message
                .metadata
                .insert(META_RUN_ID.to_owned(), Value::String(run_id.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    fn msg(n: usize) -> Message {
        Message::new(Role::Agent, format!("m{n}"))
    }

    mod history_bounds {
        use super::*;

        #[test]
        fn short_term_overflow_moves_oldest_to_long_term() {
            let mut context = AgentContext::new().with_memory_bounds(3, 10);
            for n in 0..5 {
                context.add_short_term_message(msg(n));
            }
            assert_eq!(context.short_term.len(), 3);
            assert_eq!(context.long_term.len(), 2);
            assert_eq!(context.short_term[0].content, "m2");
            assert_eq!(context.long_term[0].content, "m0");
        }

        #[test]
        fn long_term_overflow_drops_silently() {
            let mut context = AgentContext::new().with_memory_bounds(1, 2);
            for n in 0..6 {
                context.add_short_term_message(msg(n));
            }
            assert_eq!(context.short_term.len(), 1);
            assert_eq!(context.long_term.len(), 2);
            // Only the two most recently evicted messages survive.
            assert_eq!(context.long_term[0].content, "m3");
            assert_eq!(context.long_term[1].content, "m4");
        }

        #[test]
        fn bounds_hold_after_every_mutation() {
            let mut context = AgentContext::new().with_memory_bounds(4, 4);
            for n in 0..50 {
                context.add_short_term_message(msg(n));
                assert!(context.short_term.len() <= context.max_short_term());
                assert!(context.long_term.len() <= context.max_long_term());
            }
        }

        #[test]
        fn default_bounds() {
            let context = AgentContext::new();
            assert_eq!(context.max_short_term(), DEFAULT_MAX_SHORT_TERM);
            assert_eq!(context.max_long_term(), DEFAULT_MAX_LONG_TERM);
        }
    }

    mod run_metadata {
        use super::*;

        #[test]
        fn stamping_applies_both_ids() {
            let mut context = AgentContext::new();
            context.set_run_context("sess-1", "run-1");

            let mut message = Message::new(Role::User, "task");
            context.apply_run_metadata(&mut message);
            assert_eq!(message.session_id(), Some("sess-1"));
            assert_eq!(message.run_id(), Some("run-1"));
        }

        #[test]
        fn existing_stamps_are_preserved() {
            let mut context = AgentContext::new();
            context.set_run_context("sess-new", "run-new");

            let mut message = Message::new(Role::User, "task")
                .with_meta(META_SESSION_ID, "sess-old")
                .with_meta(META_RUN_ID, "run-old");
            context.apply_run_metadata(&mut message);
            assert_eq!(message.session_id(), Some("sess-old"));
            assert_eq!(message.run_id(), Some("run-old"));
        }

        #[test]
        fn unset_context_stamps_nothing() {
            let context = AgentContext::new();
            let mut message = Message::new(Role::User, "task");
            context.apply_run_metadata(&mut message);
            assert!(message.session_id().is_none());
            assert!(message.run_id().is_none());
        }
    }

    mod tools {
        use super::*;
        use serde_json::json;

        #[test]
        fn register_and_replace() {
            let mut context = AgentContext::new();
            context.register_tool(Tool::new("t", "first", |_| Ok(json!(1))));
            context.register_tool(Tool::new("t", "second", |_| Ok(json!(2))));
            assert_eq!(context.tools.len(), 1);
            assert_eq!(context.tools["t"].description, "second");
        }

        #[test]
        fn with_tools_copies_registry() {
            let mut registry = ToolRegistry::new();
            registry.register(Tool::new("a", "", |_| Ok(Value::Null)));
            registry.register(Tool::new("b", "", |_| Ok(Value::Null)));

            let context = AgentContext::new().with_tools(&registry);
            assert_eq!(context.tools.len(), 2);
        }
    }
}
