//! The execution agent.
//!
//! Walks a plan step by step: dispatches each step's tool under policy and
//! reliability guards, summarizes the outcome through the model, and emits
//! one observation message per step. Step failures are contained in the
//! step result; a single failed step never fails the whole run.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, error, instrument, warn};

use crate::agent::Agent;
use crate::context::AgentContext;
use crate::error::Result;
use crate::llm::{LlmClient, LlmResponse, PromptMessage, estimate_tokens};
use crate::message::{META_TYPE, Message, Role};
use crate::plan::{Plan, PlanStep, StepResult};
use crate::policy::Decision;
use crate::tool::{Tool, ToolArgs};

/// System instruction given to the summarizing model.
pub const EXECUTOR_SYSTEM_PROMPT: &str = "\
You are an execution agent. You receive:
- a high-level task
- the current step description
- the tool output (if any)

You produce a short textual result for this step.";

/// Longest tool output echoed into events.
const EVENT_OUTPUT_LIMIT: usize = 500;

/// Executes plans produced by the planner.
pub struct ExecutorAgent {
    name: String,
    /// The executor's context: tools, model, history, collaborators.
    pub context: AgentContext,
    llm: Arc<dyn LlmClient>,
}

impl std::fmt::Debug for ExecutorAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorAgent")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

enum ToolDispatch {
    /// Short-circuit outcome decided without invoking anything.
    Done(StepResult),
    /// The tool to invoke with normalized arguments.
    Invoke(Tool, ToolArgs),
}

impl ExecutorAgent {
    /// Create an executor.
    #[must_use]
    pub fn new(name: impl Into<String>, context: AgentContext, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            name: name.into(),
            context,
            llm,
        }
    }

    fn emit(&self, name: &str, payload: Value) {
        if let Some(events) = &self.context.events {
            events.emit_named(name, &self.name, payload);
        }
    }

    /// Everything that happens before a tool is actually invoked: lookup,
    /// policy, input normalization, replay. Failures become step results.
    fn prepare_dispatch(&self, step: &PlanStep) -> ToolDispatch {
        let Some(tool_name) = &step.tool else {
            return ToolDispatch::Done(StepResult::success(step.id, Value::Null));
        };

        let Some(tool) = self.context.tools.get(tool_name) else {
            let error_msg = format!("Tool '{tool_name}' not found");
            error!(agent = %self.name, tool = %tool_name, "tool not found");
            self.emit("executor.tool.not_found", json!({"tool": tool_name}));
            self.emit(
                "tool.latency",
                json!({"tool": tool_name, "latency_ms": 0.0, "success": false}),
            );
            return ToolDispatch::Done(StepResult::failure(step.id, error_msg));
        };

        self.emit(
            "executor.tool.call",
            json!({"tool": tool_name, "inputs": step.inputs}),
        );

        // Plans are immutable: absent inputs normalize to an empty map on a
        // local copy, never written back to the step.
        let inputs = step.inputs.clone().unwrap_or_default();

        if let Some(policy_engine) = &self.context.policy_engine {
            let org_id = self.context.org_id.as_deref().unwrap_or("default");
            if let Decision::Deny(reason) = policy_engine.authorize(org_id, tool_name, &inputs) {
                warn!(agent = %self.name, tool = %tool_name, %reason, "policy denied tool call");
                self.emit(
                    "executor.tool.error",
                    json!({"tool": tool_name, "error": reason, "error_type": "PolicyDenied"}),
                );
                self.emit(
                    "tool.latency",
                    json!({"tool": tool_name, "latency_ms": 0.0, "success": false}),
                );
                return ToolDispatch::Done(StepResult::failure(step.id, reason));
            }
        }

        if self.context.replay_mode
            && let Some(store) = &self.context.replay_store
            && let Some(cached) = store.get(&step.id.to_string())
        {
            debug!(agent = %self.name, step_id = step.id, "replay store hit, skipping tool");
            self.emit(
                "executor.tool.result",
                json!({"tool": tool_name, "output": truncate(&cached.to_string()), "replayed": true}),
            );
            return ToolDispatch::Done(StepResult::success(step.id, cached));
        }

        ToolDispatch::Invoke(tool.clone(), inputs)
    }

    fn finish_invocation(
        &self,
        step: &PlanStep,
        tool_name: &str,
        outcome: Result<Value>,
        started: Instant,
    ) -> StepResult {
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let success = outcome.is_ok();

        let result = match outcome {
            Ok(output) => {
                debug!(agent = %self.name, tool = %tool_name, "tool executed successfully");
                self.emit(
                    "executor.tool.result",
                    json!({"tool": tool_name, "output": truncate(&output.to_string())}),
                );
                StepResult::success(step.id, output)
            }
            Err(err) => {
                error!(agent = %self.name, tool = %tool_name, error = %err, "tool execution failed");
                self.emit(
                    "executor.tool.error",
                    json!({"tool": tool_name, "error": err.to_string()}),
                );
                StepResult::failure(step.id, err.to_string())
            }
        };

        self.emit(
            "tool.latency",
            json!({"tool": tool_name, "latency_ms": latency_ms, "success": success}),
        );
        if let Some(observability) = &self.context.observability {
            observability.record_tool_execution(tool_name, latency_ms, success);
        }
        result
    }

    /// Run one step's tool synchronously.
    fn run_tool(&self, step: &PlanStep) -> StepResult {
        self.emit(
            "executor.step.start",
            json!({"step_id": step.id, "description": step.description}),
        );

        let (tool, inputs) = match self.prepare_dispatch(step) {
            ToolDispatch::Done(result) => return result,
            ToolDispatch::Invoke(tool, inputs) => (tool, inputs),
        };
        let tool_name = tool.name.clone();

        let started = Instant::now();
        let outcome = match &self.context.reliability {
            Some(reliability) => {
                reliability.execute(&format!("tool:{tool_name}"), || tool.invoke(&inputs))
            }
            None => tool.invoke(&inputs),
        };
        self.finish_invocation(step, &tool_name, outcome, started)
    }

    /// Run one step's tool from an async context.
    ///
    /// Synchronous tools are offloaded to the blocking pool by
    /// [`Tool::invoke_async`].
    async fn run_tool_async(&self, step: &PlanStep) -> StepResult {
        self.emit(
            "executor.step.start",
            json!({"step_id": step.id, "description": step.description}),
        );

        let (tool, inputs) = match self.prepare_dispatch(step) {
            ToolDispatch::Done(result) => return result,
            ToolDispatch::Invoke(tool, inputs) => (tool, inputs),
        };
        let tool_name = tool.name.clone();

        let started = Instant::now();
        let outcome = match &self.context.reliability {
            Some(reliability) => {
                reliability
                    .execute_async(&format!("tool:{tool_name}"), || {
                        tool.invoke_async(inputs.clone())
                    })
                    .await
            }
            None => tool.invoke_async(inputs).await,
        };
        self.finish_invocation(step, &tool_name, outcome, started)
    }

    fn summary_prompt(&self, task: &str, step: &PlanStep, result: &StepResult) -> Vec<PromptMessage> {
        let tool_output_text = if result.success {
            format!("SUCCESS: {}", result.output)
        } else {
            format!("ERROR: {}", result.error.as_deref().unwrap_or("unknown"))
        };
        vec![
            PromptMessage::system(EXECUTOR_SYSTEM_PROMPT),
            PromptMessage::user(format!(
                "Task: {task}\nStep {}: {}\nTool: {}\nOutput: {tool_output_text}",
                step.id,
                step.description,
                step.tool.as_deref().unwrap_or("none"),
            )),
        ]
    }

    fn plain_summary(step: &PlanStep, result: &StepResult) -> String {
        let status = if result.success { "succeeded" } else { "failed" };
        let detail = result
            .error
            .clone()
            .unwrap_or_else(|| result.output.to_string());
        format!("Step {} {status}: {detail}", step.id)
    }

    fn check_rate_limit(&self, tokens: u64) -> Result<()> {
        if let Some(limiter) = &self.context.rate_limiter
            && let Some(model_config) = &self.context.model_config
        {
            let tenant = self.context.org_id.as_deref().unwrap_or("default");
            limiter.check(&self.name, &model_config.name, tokens, tenant)?;
        }
        Ok(())
    }

    fn emit_llm_events(&self, response: &LlmResponse, latency_ms: f64) {
        let Some(model_config) = &self.context.model_config else {
            return;
        };
        self.emit(
            "llm.latency",
            json!({"model": model_config.name, "latency_ms": latency_ms}),
        );
        self.emit(
            "llm.usage",
            json!({
                "model": model_config.name,
                "prompt_tokens": response.prompt_tokens,
                "completion_tokens": response.completion_tokens,
                "total_tokens": response.total_tokens,
            }),
        );
        if let Some(observability) = &self.context.observability {
            observability.metrics().record_latency("model_call", latency_ms);
        }
    }

    /// Summarize a step result through the model.
    ///
    /// Model failures become the summary text; they never flip a successful
    /// tool step into a failed one.
    ///
    /// # Errors
    ///
    /// Only rate-limit exhaustion propagates.
    fn summarize_step(&self, task: &str, step: &PlanStep, result: &StepResult) -> Result<String> {
        let Some(model_config) = self.context.model_config.clone() else {
            return Ok(Self::plain_summary(step, result));
        };

        let messages = self.summary_prompt(task, step, result);
        self.check_rate_limit(estimate_tokens(&messages))?;

        let start = Instant::now();
        let outcome = match &self.context.reliability {
            Some(reliability) => reliability.execute(&format!("llm:{}", model_config.name), || {
                self.llm.generate(&messages, &model_config)
            }),
            None => self.llm.generate(&messages, &model_config),
        };

        match outcome {
            Ok(response) => {
                self.emit_llm_events(&response, start.elapsed().as_secs_f64() * 1000.0);
                Ok(response.text)
            }
            Err(err) => {
                error!(agent = %self.name, step_id = step.id, error = %err, "step summarization failed");
                self.emit(
                    "llm.error",
                    json!({"error": err.to_string(), "step_id": step.id}),
                );
                Ok(format!("Failed to summarize step: {err}"))
            }
        }
    }

    /// Async variant of [`ExecutorAgent::summarize_step`].
    async fn summarize_step_async(
        &self,
        task: &str,
        step: &PlanStep,
        result: &StepResult,
    ) -> Result<String> {
        let Some(model_config) = self.context.model_config.clone() else {
            return Ok(Self::plain_summary(step, result));
        };

        let messages = self.summary_prompt(task, step, result);
        self.check_rate_limit(estimate_tokens(&messages))?;

        let start = Instant::now();
        let outcome = match &self.context.reliability {
            Some(reliability) => {
                reliability
                    .execute_async(&format!("llm:{}", model_config.name), || {
                        self.llm.generate_async(&messages, &model_config)
                    })
                    .await
            }
            None => self.llm.generate_async(&messages, &model_config).await,
        };

        match outcome {
            Ok(response) => {
                self.emit_llm_events(&response, start.elapsed().as_secs_f64() * 1000.0);
                Ok(response.text)
            }
            Err(err) => {
                error!(agent = %self.name, step_id = step.id, error = %err, "step summarization failed");
                self.emit(
                    "llm.error",
                    json!({"error": err.to_string(), "step_id": step.id}),
                );
                Ok(format!("Failed to summarize step: {err}"))
            }
        }
    }

    fn observation_message(&mut self, step: &PlanStep, result: &StepResult, summary: &str) -> Message {
        let content = format!("Step {}: {}\nResult: {summary}", step.id, step.description);
        let mut message = Message::new(Role::Agent, content)
            .with_meta(META_TYPE, "execution_step")
            .with_meta("step_id", step.id)
            .with_meta("tool", step.tool.clone().map_or(Value::Null, Value::String))
            .with_meta("success", result.success);
        self.context.apply_run_metadata(&mut message);
        self.context.add_short_term_message(message.clone());
        self.emit(
            "executor.step.complete",
            json!({"step_id": step.id, "success": result.success}),
        );
        message
    }

    /// Execute every step of a plan in order, returning one observation
    /// message per step.
    ///
    /// # Errors
    ///
    /// Only rate-limit exhaustion propagates; step failures are contained
    /// in the per-step metadata.
    #[instrument(skip(self, plan), fields(agent = %self.name, steps = plan.steps.len()))]
    pub fn execute_plan(&mut self, plan: &Plan) -> Result<Vec<Message>> {
        let mut messages = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let result = self.run_tool(step);
            let summary = self.summarize_step(&plan.task, step, &result)?;
            messages.push(self.observation_message(step, &result, &summary));
        }
        Ok(messages)
    }

    /// Async variant of [`ExecutorAgent::execute_plan`].
    ///
    /// # Errors
    ///
    /// Same contract as [`ExecutorAgent::execute_plan`].
    #[instrument(skip(self, plan), fields(agent = %self.name, steps = plan.steps.len()))]
    pub async fn execute_plan_async(&mut self, plan: &Plan) -> Result<Vec<Message>> {
        let mut messages = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let result = self.run_tool_async(step).await;
            let summary = self.summarize_step_async(&plan.task, step, &result).await?;
            messages.push(self.observation_message(step, &result, &summary));
        }
        Ok(messages)
    }

    fn empty_plan_message(&self) -> Message {
        let mut message =
            Message::new(Role::Agent, "No steps to execute").with_meta(META_TYPE, "execution");
        self.context.apply_run_metadata(&mut message);
        message
    }
}

#[async_trait]
impl Agent for ExecutorAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self, incoming: Message) -> Result<Message> {
        let plan = Plan::parse(&incoming.content)?;
        self.context.add_short_term_message(incoming);
        let messages = self.execute_plan(&plan)?;
        Ok(messages
            .into_iter()
            .next_back()
            .unwrap_or_else(|| self.empty_plan_message()))
    }

    async fn step_async(&mut self, incoming: Message) -> Result<Message> {
        let plan = Plan::parse(&incoming.content)?;
        self.context.add_short_term_message(incoming);
        let messages = self.execute_plan_async(&plan).await?;
        Ok(messages
            .into_iter()
            .next_back()
            .unwrap_or_else(|| self.empty_plan_message()))
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= EVENT_OUTPUT_LIMIT {
        text.to_owned()
    } else {
        let mut end = EVENT_OUTPUT_LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_owned()
    }
}
