//! The planning agent.
//!
//! Consumes a user task, prompts the model with the task plus a catalog of
//! available tools, and parses the response into a [`Plan`]. Output that is
//! not a well-formed plan never fails the run: the planner falls back to a
//! degenerate one-step plan carrying the raw text.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{instrument, warn};

use crate::agent::Agent;
use crate::context::AgentContext;
use crate::error::{Result, TasukiError};
use crate::llm::{LlmClient, LlmResponse, PromptMessage, estimate_tokens};
use crate::message::{META_TYPE, Message, Role};
use crate::plan::{Plan, PlanStep};

/// System instruction given to the planning model.
pub const PLANNER_SYSTEM_PROMPT: &str = "\
You are a planning agent. Given a user task and a list of tools,
you break the task into a small number of ordered steps.

Respond ONLY with valid JSON:
{
  \"task\": \"...\",
  \"steps\": [
    {\"id\": 1, \"description\": \"...\", \"tool\": \"optional_or_null\", \"inputs\": {...}, \"notes\": \"optional\"}
  ]
}";

/// Decomposes user tasks into plans by prompting the model.
pub struct PlannerAgent {
    name: String,
    /// The planner's context: tools, model, history, collaborators.
    pub context: AgentContext,
    llm: Arc<dyn LlmClient>,
}

impl std::fmt::Debug for PlannerAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannerAgent")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PlannerAgent {
    /// Create a planner.
    #[must_use]
    pub fn new(name: impl Into<String>, context: AgentContext, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            name: name.into(),
            context,
            llm,
        }
    }

    fn build_prompt(&self, task: &str) -> Vec<PromptMessage> {
        let mut tool_lines: Vec<String> = self
            .context
            .tools
            .values()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect();
        tool_lines.sort_unstable();
        let tools_desc = if tool_lines.is_empty() {
            "None".to_owned()
        } else {
            tool_lines.join("\n")
        };

        vec![
            PromptMessage::system(PLANNER_SYSTEM_PROMPT),
            PromptMessage::user(format!(
                "User task:\n{task}\n\nAvailable tools:\n{tools_desc}"
            )),
        ]
    }

    fn emit(&self, name: &str, payload: Value) {
        if let Some(events) = &self.context.events {
            events.emit_named(name, &self.name, payload);
        }
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

    /// Interpret raw model output as a plan.
    ///
    /// Malformed JSON yields a degenerate plan carrying the raw text; valid
    /// JSON without a `steps` array yields one prefixed with `Plan: `.
    fn interpret_output(&self, task: &str, raw: &str) -> Plan {
        let Ok(data) = serde_json::from_str::<Value>(raw) else {
            warn!(agent = %self.name, "model output is not JSON, falling back to degenerate plan");
            return Plan::degenerate(task, raw);
        };

        let Some(steps) = data.get("steps").and_then(Value::as_array) else {
            warn!(agent = %self.name, "model output missing 'steps', falling back to degenerate plan");
            return Plan::degenerate(task, format!("Plan: {raw}"));
        };

        let parsed_steps = steps
            .iter()
            .enumerate()
            .map(|(index, step)| PlanStep {
                id: step
                    .get("id")
                    .and_then(Value::as_i64)
                    .unwrap_or(index as i64 + 1),
                description: step
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                tool: step
                    .get("tool")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                inputs: step
                    .get("inputs")
                    .and_then(Value::as_object)
                    .cloned(),
                notes: step
                    .get("notes")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            })
            .collect();

        Plan::new(
            data.get("task")
                .and_then(Value::as_str)
                .unwrap_or(task)
                .to_owned(),
            parsed_steps,
        )
    }

    fn generate(&self, prompt: &[PromptMessage]) -> Result<LlmResponse> {
        let Some(model_config) = &self.context.model_config else {
            return Err(TasukiError::configuration("planner has no model config"));
        };
        match &self.context.reliability {
            Some(reliability) => reliability.execute(&format!("llm:{}", model_config.name), || {
                self.llm.generate(prompt, model_config)
            }),
            None => self.llm.generate(prompt, model_config),
        }
    }

    async fn generate_async(&self, prompt: &[PromptMessage]) -> Result<LlmResponse> {
        let Some(model_config) = &self.context.model_config else {
            return Err(TasukiError::configuration("planner has no model config"));
        };
        match &self.context.reliability {
            Some(reliability) => {
                reliability
                    .execute_async(&format!("llm:{}", model_config.name), || {
                        self.llm.generate_async(prompt, model_config)
                    })
                    .await
            }
            None => self.llm.generate_async(prompt, model_config).await,
        }
    }

    /// Produce a plan for the task.
    ///
    /// Model failures degrade to a one-step error plan rather than failing
    /// the run; the only hard failure is rate-limit exhaustion, which is
    /// surfaced so callers can back off.
    ///
    /// # Errors
    ///
    /// Returns a rate-limit error when the pre-flight check rejects the
    /// prompt.
    #[instrument(skip(self), fields(agent = %self.name))]
    pub fn plan(&self, task: &str) -> Result<Plan> {
        self.emit("planner.start", json!({"task": task}));

        let prompt = self.build_prompt(task);
        let tokens_estimate = estimate_tokens(&prompt);
        if let Err(err) = self.check_rate_limit(tokens_estimate) {
            self.emit("planner.error", json!({"error": err.to_string()}));
            return Err(err);
        }

        let start = Instant::now();
        let plan = match self.generate(&prompt) {
            Ok(response) => {
                self.emit_llm_events(&response, start.elapsed().as_secs_f64() * 1000.0);
                self.emit("planner.raw_output", json!({"raw": response.text}));
                self.interpret_output(task, &response.text)
            }
            Err(err) => {
                warn!(agent = %self.name, error = %err, "planning model call failed");
                self.emit("planner.error", json!({"error": err.to_string()}));
                Plan::degenerate(task, format!("Error during planning: {err}"))
            }
        };

        self.emit("planner.complete", json!({"steps": plan.steps.len()}));
        Ok(plan)
    }

    /// Async variant of [`PlannerAgent::plan`].
    ///
    /// # Errors
    ///
    /// Same contract as [`PlannerAgent::plan`].
    #[instrument(skip(self), fields(agent = %self.name))]
    pub async fn plan_async(&self, task: &str) -> Result<Plan> {
        self.emit("planner.start", json!({"task": task}));

        let prompt = self.build_prompt(task);
        let tokens_estimate = estimate_tokens(&prompt);
        if let Err(err) = self.check_rate_limit(tokens_estimate) {
            self.emit("planner.error", json!({"error": err.to_string()}));
            return Err(err);
        }

        let start = Instant::now();
        let plan = match self.generate_async(&prompt).await {
            Ok(response) => {
                self.emit_llm_events(&response, start.elapsed().as_secs_f64() * 1000.0);
                self.emit("planner.raw_output", json!({"raw": response.text}));
                self.interpret_output(task, &response.text)
            }
            Err(err) => {
                warn!(agent = %self.name, error = %err, "planning model call failed");
                self.emit("planner.error", json!({"error": err.to_string()}));
                Plan::degenerate(task, format!("Error during planning: {err}"))
            }
        };

        self.emit("planner.complete", json!({"steps": plan.steps.len()}));
        Ok(plan)
    }

    fn plan_reply(&mut self, incoming: Message, plan: &Plan) -> Result<Message> {
        let content = plan.to_json()?;
        let mut reply = Message::new(Role::Agent, content).with_meta(META_TYPE, "plan");
        self.context.apply_run_metadata(&mut reply);
        self.context.add_short_term_message(incoming);
        self.context.add_short_term_message(reply.clone());
        Ok(reply)
    }
}

#[async_trait]
impl Agent for PlannerAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self, incoming: Message) -> Result<Message> {
        let plan = self.plan(&incoming.content)?;
        self.plan_reply(incoming, &plan)
    }

    async fn step_async(&mut self, incoming: Message) -> Result<Message> {
        let plan = self.plan_async(&incoming.content).await?;
        self.plan_reply(incoming, &plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RateLimitCode;
    use crate::llm::{MockLlmClient, ScriptedLlmClient};
    use crate::model::ModelConfig;
    use crate::observability::EventBus;
    use crate::ratelimit::{RateLimitRule, RateLimitScope, RateLimiter};
    use crate::tool::Tool;

    fn mock_context() -> AgentContext {
        AgentContext::new()
            .with_model_config(ModelConfig::new("mock", "mock", "mock-1"))
            .with_events(EventBus::new())
    }

    fn planner_with(llm: Arc<dyn LlmClient>) -> PlannerAgent {
        PlannerAgent::new("planner", mock_context(), llm)
    }

    mod output_interpretation {
        use super::*;

        #[test]
        fn well_formed_plan_parses() {
            let raw = r#"{"task":"t","steps":[{"id":1,"description":"a","tool":"echo","inputs":{}},{"id":2,"description":"b"}]}"#;
            let planner = planner_with(Arc::new(ScriptedLlmClient::new(vec![raw.into()])));
            let plan = planner.plan("t").unwrap();
            assert_eq!(plan.steps.len(), 2);
            assert_eq!(plan.steps[0].tool.as_deref(), Some("echo"));
            assert!(plan.steps[1].tool.is_none());
        }

        #[test]
        fn unparseable_output_becomes_degenerate_plan() {
            let planner = planner_with(Arc::new(ScriptedLlmClient::new(vec!["not json".into()])));
            let plan = planner.plan("do something").unwrap();
            assert_eq!(plan.steps.len(), 1);
            assert_eq!(plan.steps[0].id, 1);
            assert_eq!(plan.steps[0].description, "not json");
        }

        #[test]
        fn json_without_steps_is_prefixed() {
            let planner =
                planner_with(Arc::new(ScriptedLlmClient::new(vec![r#"{"answer":42}"#.into()])));
            let plan = planner.plan("task").unwrap();
            assert_eq!(plan.steps.len(), 1);
            assert!(plan.steps[0].description.starts_with("Plan: "));
        }

        #[test]
        fn missing_step_ids_are_numbered() {
            let raw = r#"{"task":"t","steps":[{"description":"a"},{"description":"b"}]}"#;
            let planner = planner_with(Arc::new(ScriptedLlmClient::new(vec![raw.into()])));
            let plan = planner.plan("t").unwrap();
            assert_eq!(plan.steps[0].id, 1);
            assert_eq!(plan.steps[1].id, 2);
        }
    }

    mod prompting {
        use super::*;

        #[test]
        fn prompt_lists_tools() {
            let mut context = mock_context();
            context.register_tool(Tool::new("echo", "Echo things back", |_| Ok(Value::Null)));
            let planner = PlannerAgent::new("planner", context, Arc::new(MockLlmClient::new()));

            let prompt = planner.build_prompt("task");
            assert_eq!(prompt.len(), 2);
            assert!(prompt[1].content.contains("- echo: Echo things back"));
        }

        #[test]
        fn prompt_without_tools_says_none() {
            let planner = planner_with(Arc::new(MockLlmClient::new()));
            let prompt = planner.build_prompt("task");
            assert!(prompt[1].content.contains("Available tools:\nNone"));
        }
    }

    mod events {
        use super::*;

        #[test]
        fn successful_plan_emits_lifecycle_events() {
            let planner = planner_with(Arc::new(MockLlmClient::new()));
            planner.plan("task").unwrap();

            let events = planner.context.events.as_ref().unwrap();
            assert_eq!(events.count_named("planner.start"), 1);
            assert_eq!(events.count_named("llm.latency"), 1);
            assert_eq!(events.count_named("llm.usage"), 1);
            assert_eq!(events.count_named("planner.raw_output"), 1);
            assert_eq!(events.count_named("planner.complete"), 1);
            assert_eq!(events.count_named("planner.error"), 0);
        }
    }

    mod rate_limiting {
        use super::*;

        #[test]
        fn exhausted_token_budget_surfaces() {
            let limiter = Arc::new(RateLimiter::new(vec![
                RateLimitRule::new("r", RateLimitScope::Model).with_max_tokens(2),
            ]));
            let mut planner = planner_with(Arc::new(MockLlmClient::new()));
            planner.context.rate_limiter = Some(limiter);

            let err = planner
                .plan("a task with quite a few words in it")
                .unwrap_err();
            match err {
                TasukiError::RateLimit(e) => assert_eq!(e.code, RateLimitCode::Tokens),
                other => panic!("expected rate limit error, got {other}"),
            }

            let events = planner.context.events.as_ref().unwrap();
            assert_eq!(events.count_named("planner.error"), 1);
        }
    }

    mod stepping {
        use super::*;

        #[test]
        fn step_returns_plan_message() {
            let mut planner = planner_with(Arc::new(MockLlmClient::new()));
            planner.context.set_run_context("sess-1", "run-1");

            let reply = planner.step(Message::new(Role::User, "hello")).unwrap();
            assert_eq!(reply.message_type(), Some("plan"));
            assert_eq!(reply.session_id(), Some("sess-1"));
            assert_eq!(reply.run_id(), Some("run-1"));
            assert!(Plan::parse(&reply.content).is_ok());
            // Incoming and reply are both in history.
            assert_eq!(planner.context.short_term.len(), 2);
        }

        #[tokio::test]
        async fn step_async_matches_sync_shape() {
            let mut planner = planner_with(Arc::new(MockLlmClient::new()));
            planner.context.set_run_context("sess-1", "run-1");

            let reply = planner
                .step_async(Message::new(Role::User, "hello"))
                .await
                .unwrap();
            assert_eq!(reply.message_type(), Some("plan"));
            assert!(Plan::parse(&reply.content).is_ok());
        }
    }
}
