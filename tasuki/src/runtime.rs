//! The planner/executor runtime.
//!
//! Wires a [`PlannerAgent`] to an [`ExecutorAgent`], resolves and
//! propagates session/run identifiers, and exposes synchronous and
//! asynchronous entry points. Sessions persist across calls; run IDs are
//! always fresh per call.

use tracing::{info, instrument};
use uuid::Uuid;

use crate::agent::Agent;
use crate::error::Result;
use crate::executor::ExecutorAgent;
use crate::message::{Message, Role};
use crate::planner::PlannerAgent;

/// Generate a fresh session identifier.
#[must_use]
pub fn new_session_id() -> String {
    format!("sess_{}", Uuid::new_v4().simple())
}

/// Generate a fresh run identifier.
#[must_use]
pub fn new_run_id() -> String {
    format!("run_{}", Uuid::new_v4().simple())
}

/// Runs the plan-then-execute pipeline for one task at a time.
#[derive(Debug)]
pub struct PlannerExecutorRuntime {
    /// The planning agent.
    pub planner: PlannerAgent,
    /// The executing agent.
    pub executor: ExecutorAgent,
}

impl PlannerExecutorRuntime {
    /// Create a runtime from its two agents.
    #[must_use]
    pub fn new(planner: PlannerAgent, executor: ExecutorAgent) -> Self {
        Self { planner, executor }
    }

    /// Resolve the run context and propagate it into both agents.
    ///
    /// The session is the explicit one, else the planner's current one,
    /// else freshly generated. The run ID is fresh unless supplied.
    fn prepare_run_context(&mut self, session_id: Option<&str>, run_id: Option<&str>) {
        let resolved_session = session_id
            .map(str::to_owned)
            .or_else(|| self.planner.context.session_id.clone())
            .unwrap_or_else(new_session_id);
        let resolved_run = run_id.map(str::to_owned).unwrap_or_else(new_run_id);

        info!(session = %resolved_session, run = %resolved_run, "starting run");
        self.planner
            .context
            .set_run_context(resolved_session.clone(), resolved_run.clone());
        self.executor
            .context
            .set_run_context(resolved_session, resolved_run);
    }

    fn task_message(&self, task: &str) -> Message {
        let mut message = Message::new(Role::User, task);
        self.planner.context.apply_run_metadata(&mut message);
        message
    }

    /// Run one planner+executor pass over the task.
    ///
    /// Returns the plan message followed by the final execution message.
    /// With observability configured, each agent step runs inside an
    /// `agent_execute:<name>` span.
    ///
    /// # Errors
    ///
    /// Propagates rate-limit failures and plan-parse bugs; individual step
    /// failures stay inside the execution message metadata.
    #[instrument(skip(self, task))]
    pub fn run(
        &mut self,
        task: &str,
        session_id: Option<&str>,
        run_id: Option<&str>,
    ) -> Result<Vec<Message>> {
        self.prepare_run_context(session_id, run_id);
        let task_message = self.task_message(task);

        let observability = self.planner.context.observability.clone();
        let (plan_message, execution_message) = match observability {
            Some(observability) => {
                let planner_name = self.planner.name().to_owned();
                let plan_message = observability
                    .trace_agent_execution(&planner_name, task, || self.planner.step(task_message))?;

                let executor_name = self.executor.name().to_owned();
                let execution_message = observability.trace_agent_execution(
                    &executor_name,
                    task,
                    || self.executor.step(plan_message.clone()),
                )?;
                (plan_message, execution_message)
            }
            None => {
                let plan_message = self.planner.step(task_message)?;
                let execution_message = self.executor.step(plan_message.clone())?;
                (plan_message, execution_message)
            }
        };

        Ok(vec![plan_message, execution_message])
    }

    /// Async variant of [`PlannerExecutorRuntime::run`].
    ///
    /// # Errors
    ///
    /// Same contract as [`PlannerExecutorRuntime::run`].
    #[instrument(skip(self, task))]
    pub async fn run_async(
        &mut self,
        task: &str,
        session_id: Option<&str>,
        run_id: Option<&str>,
    ) -> Result<Vec<Message>> {
        self.prepare_run_context(session_id, run_id);
        let task_message = self.task_message(task);

        let observability = self.planner.context.observability.clone();
        let (plan_message, execution_message) = match observability {
            Some(observability) => {
                let planner_name = self.planner.name().to_owned();
                let plan_message = observability
                    .trace_agent_execution_async(
                        &planner_name,
                        task,
                        self.planner.step_async(task_message),
                    )
                    .await?;

                let executor_name = self.executor.name().to_owned();
                let execution_message = observability
                    .trace_agent_execution_async(
                        &executor_name,
                        task,
                        self.executor.step_async(plan_message.clone()),
                    )
                    .await?;
                (plan_message, execution_message)
            }
            None => {
                let plan_message = self.planner.step_async(task_message).await?;
                let execution_message = self.executor.step_async(plan_message.clone()).await?;
                (plan_message, execution_message)
            }
        };

        Ok(vec![plan_message, execution_message])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AgentContext;
    use crate::llm::{MockLlmClient, ScriptedLlmClient};
    use crate::model::ModelConfig;
    use crate::observability::EventBus;
    use std::sync::Arc;

    fn make_runtime() -> PlannerExecutorRuntime {
        let model_config = ModelConfig::new("mock", "mock", "mock-1");
        let llm = Arc::new(MockLlmClient::new());
        let planner_context = AgentContext::new()
            .with_model_config(model_config.clone())
            .with_events(EventBus::new());
        let executor_context = AgentContext::new()
            .with_model_config(model_config)
            .with_events(EventBus::new());
        PlannerExecutorRuntime::new(
            PlannerAgent::new("planner", planner_context, llm.clone()),
            ExecutorAgent::new("executor", executor_context, llm),
        )
    }

    mod session_run_propagation {
        use super::*;

        #[test]
        fn explicit_ids_are_stamped_on_both_messages() {
            let mut runtime = make_runtime();
            let messages = runtime
                .run("hello", Some("sess_test"), Some("run_test"))
                .unwrap();

            assert_eq!(runtime.planner.context.session_id.as_deref(), Some("sess_test"));
            assert_eq!(runtime.executor.context.session_id.as_deref(), Some("sess_test"));
            assert_eq!(runtime.planner.context.run_id.as_deref(), Some("run_test"));

            assert_eq!(messages.len(), 2);
            let plan_message = &messages[0];
            let execution_message = &messages[1];

            assert_eq!(plan_message.message_type(), Some("plan"));
            assert_eq!(plan_message.session_id(), Some("sess_test"));
            assert_eq!(plan_message.run_id(), Some("run_test"));

            assert_eq!(execution_message.message_type(), Some("execution_step"));
            assert_eq!(execution_message.session_id(), Some("sess_test"));
            assert_eq!(execution_message.run_id(), Some("run_test"));
        }

        #[test]
        fn session_persists_and_run_id_is_fresh_per_call() {
            let mut runtime = make_runtime();
            let first = runtime.run("first run", None, None).unwrap();

            let session_id = runtime.planner.context.session_id.clone().unwrap();
            let run_id = runtime.planner.context.run_id.clone().unwrap();
            assert_eq!(first[0].session_id(), Some(session_id.as_str()));
            assert_eq!(first[1].run_id(), Some(run_id.as_str()));

            let second = runtime.run("second run", None, None).unwrap();
            assert_eq!(
                runtime.planner.context.session_id.as_deref(),
                Some(session_id.as_str())
            );
            assert_ne!(runtime.planner.context.run_id.as_deref(), Some(run_id.as_str()));
            assert_eq!(second[0].session_id(), Some(session_id.as_str()));
            assert_eq!(second[1].session_id(), Some(session_id.as_str()));
        }

        #[tokio::test]
        async fn async_run_propagates_identically() {
            let mut runtime = make_runtime();
            let messages = runtime
                .run_async("hello", Some("sess_a"), Some("run_a"))
                .await
                .unwrap();
            assert_eq!(messages[0].session_id(), Some("sess_a"));
            assert_eq!(messages[1].run_id(), Some("run_a"));
        }
    }

    mod degenerate_plans {
        use super::*;

        #[test]
        fn unparseable_model_output_still_completes_the_run() {
            let llm = Arc::new(ScriptedLlmClient::new(vec!["not json".into()]));
            let model_config = ModelConfig::new("mock", "mock", "mock-1");
            let mut runtime = PlannerExecutorRuntime::new(
                PlannerAgent::new(
                    "planner",
                    AgentContext::new().with_model_config(model_config.clone()),
                    llm.clone(),
                ),
                ExecutorAgent::new(
                    "executor",
                    AgentContext::new().with_model_config(model_config),
                    llm,
                ),
            );

            let messages = runtime.run("do something", None, None).unwrap();
            let plan = crate::plan::Plan::parse(&messages[0].content).unwrap();
            assert_eq!(plan.steps.len(), 1);
            assert_eq!(plan.steps[0].id, 1);
            assert_eq!(plan.steps[0].description, "not json");
        }
    }

    mod spans {
        use super::*;
        use crate::observability::ObservabilityManager;

        #[test]
        fn observability_wraps_agents_in_spans() {
            let observability = Arc::new(ObservabilityManager::new("test"));
            let mut runtime = make_runtime();
            runtime.planner.context.observability = Some(Arc::clone(&observability));

            runtime.run("traced task", None, None).unwrap();

            let spans = observability.tracer().spans();
            let names: Vec<&str> = spans.iter().map(|s| s.name.as_str()).collect();
            assert!(names.contains(&"agent_execute:planner"));
            assert!(names.contains(&"agent_execute:executor"));
            for span in &spans {
                assert_eq!(span.attributes["goal"], "traced task");
            }
        }
    }
}
