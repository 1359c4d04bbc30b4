#![cfg_attr(docsrs, feature(doc_cfg))]
//! Tasuki is an LLM-agnostic multi-agent execution runtime: a planner
//! decomposes a task into a structured plan, an executor runs it step by
//! step through registered tools, and the surrounding machinery provides
//! durable queued execution, rate limiting, reliability guards, governance
//! policies, and structured observability.

// Core primitives
pub mod context;
pub mod error;
pub mod message;
pub mod model;

// Model access
pub mod llm;

// Tools
pub mod registry;
pub mod tool;

// Resource and reliability guards
pub mod policy;
pub mod ratelimit;
pub mod reliability;

// Observability
pub mod observability;

// Planner/executor pipeline
pub mod agent;
pub mod executor;
pub mod plan;
pub mod planner;
pub mod runtime;

// Durable execution
pub mod queue;

// Multi-agent coordination
pub mod orchestrator;

// Presets
pub mod presets;

// Re-export the types most callers start from.
pub use agent::Agent;
pub use context::AgentContext;
pub use error::{Result, TasukiError};
pub use executor::ExecutorAgent;
pub use llm::{LlmClient, MockLlmClient};
pub use message::{Message, Role};
pub use model::ModelConfig;
pub use plan::{Plan, PlanStep, StepResult};
pub use planner::PlannerAgent;
pub use runtime::PlannerExecutorRuntime;
pub use tool::{Tool, ToolRegistry};
