//! End-to-end tests for the tasuki runtime.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use tasuki::context::AgentContext;
use tasuki::Agent;
use tasuki::error::{QueueError, RateLimitCode, TasukiError};
use tasuki::executor::ExecutorAgent;
use tasuki::llm::{MockLlmClient, ScriptedLlmClient};
use tasuki::message::{Message, Role};
use tasuki::model::ModelConfig;
use tasuki::observability::EventBus;
use tasuki::orchestrator::{
    AgentRole, ConsensusAlgorithm, MessageType, MultiAgentOrchestrator, TaskStatus,
};
use tasuki::plan::Plan;
use tasuki::planner::PlannerAgent;
use tasuki::queue::sqlite::SqliteQueueBackend;
use tasuki::queue::{DurableExecutionQueue, JobHandler, JobPayload};
use tasuki::ratelimit::{RateLimitRule, RateLimitScope, RateLimiter};
use tasuki::runtime::PlannerExecutorRuntime;
use tasuki::tool::packs::{sign_manifest, verify_manifest, ToolManifest};
use tasuki::tool::schema::ToolSchema;

fn mock_runtime() -> PlannerExecutorRuntime {
    let model = ModelConfig::new("mock", "mock", "mock-1");
    let llm = Arc::new(MockLlmClient::new());
    PlannerExecutorRuntime::new(
        PlannerAgent::new(
            "planner",
            AgentContext::new().with_model_config(model.clone()),
            llm.clone(),
        ),
        ExecutorAgent::new(
            "executor",
            AgentContext::new().with_model_config(model),
            llm,
        ),
    )
}

// Scenario A: session/run propagation.
#[test]
fn test_session_and_run_ids_propagate_to_every_message() {
    let mut runtime = mock_runtime();
    let messages = runtime
        .run("hello", Some("sess_test"), Some("run_test"))
        .unwrap();

    assert_eq!(messages.len(), 2);

    let plan_message = &messages[0];
    assert_eq!(plan_message.message_type(), Some("plan"));
    assert_eq!(plan_message.session_id(), Some("sess_test"));
    assert_eq!(plan_message.run_id(), Some("run_test"));

    let execution_message = &messages[1];
    assert_eq!(execution_message.message_type(), Some("execution_step"));
    assert_eq!(execution_message.session_id(), Some("sess_test"));
    assert_eq!(execution_message.run_id(), Some("run_test"));
}

#[test]
fn test_session_survives_runs_while_run_id_rotates() {
    let mut runtime = mock_runtime();
    runtime.run("first", None, None).unwrap();
    let session = runtime.planner.context.session_id.clone().unwrap();
    let run = runtime.planner.context.run_id.clone().unwrap();

    let second = runtime.run("second", None, None).unwrap();
    assert_eq!(runtime.planner.context.session_id.as_deref(), Some(session.as_str()));
    assert_ne!(runtime.planner.context.run_id.as_deref(), Some(run.as_str()));
    assert_eq!(second[0].session_id(), Some(session.as_str()));
}

// Scenario B: degenerate plan on unparseable model output.
#[test]
fn test_degenerate_plan_on_unparseable_output() {
    let llm = Arc::new(ScriptedLlmClient::new(vec!["not json".into()]));
    let model = ModelConfig::new("mock", "mock", "mock-1");
    let mut runtime = PlannerExecutorRuntime::new(
        PlannerAgent::new(
            "planner",
            AgentContext::new().with_model_config(model.clone()),
            llm.clone(),
        ),
        ExecutorAgent::new("executor", AgentContext::new().with_model_config(model), llm),
    );

    let messages = runtime.run("do something", None, None).unwrap();
    let plan = Plan::parse(&messages[0].content).unwrap();
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].id, 1);
    assert_eq!(plan.steps[0].description, "not json");
}

// Scenario C: tool not found.
#[test]
fn test_tool_not_found_events_and_metadata() {
    let events = EventBus::new();
    let mut executor = ExecutorAgent::new(
        "executor",
        AgentContext::new()
            .with_model_config(ModelConfig::new("mock", "mock", "mock-1"))
            .with_events(events.clone()),
        Arc::new(MockLlmClient::new()),
    );

    let incoming = Message::new(
        Role::Agent,
        r#"{"task":"t","steps":[{"id":1,"description":"use x","tool":"missing","inputs":{}}]}"#,
    );
    let reply = executor.step(incoming).unwrap();

    assert_eq!(reply.metadata["success"], false);
    assert_eq!(events.count_named("executor.tool.not_found"), 1);

    let latency = events.events_named("tool.latency");
    assert_eq!(latency.len(), 1);
    assert_eq!(latency[0].payload["latency_ms"], 0.0);
    assert_eq!(latency[0].payload["success"], false);
}

// Scenario D: rate limit exceeded on tokens.
#[test]
fn test_rate_limit_token_budget() {
    let limiter = RateLimiter::new(vec![
        RateLimitRule::new("r", RateLimitScope::Model)
            .with_max_tokens(10)
            .with_window_seconds(60),
    ]);

    limiter.check("a", "m", 6, "default").unwrap();
    let err = limiter.check("a", "m", 5, "default").unwrap_err();
    assert_eq!(err.code, RateLimitCode::Tokens);
    assert_eq!(err.code.as_str(), "RATE_LIMIT_TOKENS");

    // The first call's accounting persists.
    assert_eq!(limiter.recorded_tokens("r", "a", "m", "default"), 6);
}

// Scenario E: durable queue success after transient failure.
#[tokio::test]
async fn test_durable_queue_succeeds_after_transient_failure() {
    let backend = Arc::new(SqliteQueueBackend::in_memory().unwrap());
    let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let attempts_probe = Arc::clone(&attempts);

    let handler: JobHandler = Arc::new(move |payload| {
        let attempts = Arc::clone(&attempts_probe);
        Box::pin(async move {
            if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Err(TasukiError::internal("first attempt fails"))
            } else {
                let value = payload.get("value").and_then(Value::as_i64).unwrap();
                Ok(json!(value + 1))
            }
        })
    });

    let queue = DurableExecutionQueue::new(backend.clone(), handler)
        .with_poll_interval(Duration::from_millis(10))
        .with_max_attempts(2);
    queue.start();

    let mut payload = JobPayload::new();
    payload.insert("value".into(), json!(1));
    let result = queue.submit(payload).await.unwrap();
    queue.stop().await;

    assert_eq!(result, json!(2));
    assert!(backend.dead_letters().await.unwrap().is_empty());
    assert_eq!(backend.active_count().await.unwrap(), 0);
}

// Scenario F: durable queue dead-letters on exhaustion.
#[tokio::test]
async fn test_durable_queue_dead_letters_on_exhaustion() {
    let backend = Arc::new(SqliteQueueBackend::in_memory().unwrap());
    let handler: JobHandler =
        Arc::new(|_| Box::pin(async { Err(TasukiError::internal("boom")) }));

    let queue = DurableExecutionQueue::new(backend.clone(), handler)
        .with_poll_interval(Duration::from_millis(10))
        .with_max_attempts(1);
    queue.start();

    let mut payload = JobPayload::new();
    payload.insert("value".into(), json!(1));
    let err = queue.submit(payload).await.unwrap_err();
    queue.stop().await;

    match err {
        TasukiError::Queue(QueueError::JobFailed { error, attempts }) => {
            assert!(error.contains("boom"));
            assert_eq!(attempts, 1);
        }
        other => panic!("expected JobFailed, got {other}"),
    }

    let dead = backend.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].error.contains("boom"));
    assert_eq!(dead[0].attempts, 1);
    assert_eq!(backend.active_count().await.unwrap(), 0);
}

// Scenario G: hierarchical cancel.
#[test]
fn test_hierarchical_cancel_reaches_agents() {
    let mut orchestrator = MultiAgentOrchestrator::new("test");
    orchestrator.register_agent("a1", "Agent One", AgentRole::Worker);
    orchestrator.create_task("parent", vec!["a1".into()], None);
    orchestrator.create_task("child", vec!["a1".into()], Some("parent".into()));

    orchestrator.cancel_task("parent", "test");

    assert_eq!(orchestrator.task("parent").unwrap().status, TaskStatus::Canceled);
    assert_eq!(orchestrator.task("child").unwrap().status, TaskStatus::Canceled);

    let inbox = orchestrator.get_messages("a1");
    assert!(inbox.iter().any(|m| {
        m.message_type == MessageType::Cancel
            && m.content["task_id"] == "parent"
            && m.content["reason"] == "test"
    }));
}

// Scenario H: consensus majority.
#[test]
fn test_consensus_majority_two_of_three() {
    let mut orchestrator = MultiAgentOrchestrator::new("test");
    for id in ["a1", "a2", "a3"] {
        orchestrator.register_agent(id, id, AgentRole::Worker);
    }
    orchestrator.propose_consensus(
        "prop",
        ConsensusAlgorithm::Majority,
        vec!["a1".into(), "a2".into(), "a3".into()],
    );

    orchestrator.cast_vote("prop", "a1", true, 1.0);
    orchestrator.cast_vote("prop", "a2", true, 1.0);
    orchestrator.cast_vote("prop", "a3", false, 1.0);

    assert_eq!(orchestrator.consensus_result("prop"), Some(true));
}

#[test]
fn test_tool_schema_round_trip() {
    let schema = ToolSchema::new("lookup", "Look things up")
        .with_parameter("query", json!({"type": "string"}), true)
        .with_parameter("limit", json!({"type": "integer"}), false);

    let wire = schema.to_json_schema();
    let back = ToolSchema::from_json_schema(&wire).unwrap();
    assert_eq!(back, schema);
}

#[test]
fn test_manifest_sign_verify_laws() {
    let manifest = ToolManifest::new("core", "1.0.0", vec!["echo".into(), "math.eval".into()]);
    let signed = sign_manifest(&manifest, "secret").unwrap();

    assert!(verify_manifest(&signed, "secret"));
    assert!(!verify_manifest(&signed, "different-secret"));
}

#[tokio::test]
async fn test_async_run_with_tools_executes_them() {
    let model = ModelConfig::new("mock", "mock", "mock-1");
    // The planner output is scripted to call the tool; summaries echo.
    let plan_json = r#"{"task":"add numbers","steps":[{"id":1,"description":"add","tool":"add","inputs":{"a":2,"b":3}}]}"#;
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        plan_json.into(),
        "five".into(),
    ]));

    let mut executor_context = AgentContext::new().with_model_config(model.clone());
    executor_context.register_tool(tasuki::Tool::new("add", "Add a and b", |args| {
        let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
        Ok(json!(a + b))
    }));

    let mut runtime = PlannerExecutorRuntime::new(
        PlannerAgent::new(
            "planner",
            AgentContext::new().with_model_config(model),
            llm.clone(),
        ),
        ExecutorAgent::new("executor", executor_context, llm),
    );

    let messages = runtime.run_async("add numbers", None, None).await.unwrap();
    let execution = &messages[1];
    assert_eq!(execution.metadata["success"], true);
    assert_eq!(execution.metadata["tool"], "add");
    assert!(execution.content.contains("Result: five"));
}
