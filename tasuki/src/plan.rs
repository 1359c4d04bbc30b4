//! Plans, plan steps, and step results.
//!
//! A [`Plan`] is the planner's output: an ordered list of steps, each
//! optionally bound to a tool. Plans are request-local and immutable once
//! built; the executor works from a parsed copy and never writes back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TasukiError};
use crate::tool::ToolArgs;

/// A single unit of work within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Step identifier, unique within the plan.
    pub id: i64,
    /// What the step does.
    pub description: String,
    /// Tool to invoke, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Arguments for the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<ToolArgs>,
    /// Free-form planner notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl PlanStep {
    /// Create a tool-less step.
    #[must_use]
    pub fn new(id: i64, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            tool: None,
            inputs: None,
            notes: None,
        }
    }

    /// Bind the step to a tool (builder pattern).
    #[must_use]
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Attach tool inputs (builder pattern).
    #[must_use]
    pub fn with_inputs(mut self, inputs: ToolArgs) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Attach planner notes (builder pattern).
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// An ordered sequence of steps derived from a user task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// The task the plan addresses.
    pub task: String,
    /// Steps in execution order.
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Create a plan.
    #[must_use]
    pub fn new(task: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            task: task.into(),
            steps,
        }
    }

    /// A one-step plan carrying only a description.
    ///
    /// This is the degenerate form the planner falls back to when model
    /// output cannot be parsed.
    #[must_use]
    pub fn degenerate(task: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            steps: vec![PlanStep::new(1, description)],
        }
    }

    /// Serialize the plan to pretty JSON.
    ///
    /// # Errors
    ///
    /// Fails only if serialization fails, which plan shapes cannot trigger.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a plan from its JSON form.
    ///
    /// # Errors
    ///
    /// Fails when the payload is not a well-formed plan object.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| TasukiError::parsing(format!("invalid plan JSON: {e}")))
    }

    /// Whether the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Outcome of executing one plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// The step this result belongs to.
    pub step_id: i64,
    /// Whether the step succeeded.
    pub success: bool,
    /// Tool output, `null` for tool-less steps.
    pub output: Value,
    /// Error description, when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    /// A successful result with the given output.
    #[must_use]
    pub const fn success(step_id: i64, output: Value) -> Self {
        Self {
            step_id,
            success: true,
            output,
            error: None,
        }
    }

    /// A failed result with the given error.
    #[must_use]
    pub fn failure(step_id: i64, error: impl Into<String>) -> Self {
        Self {
            step_id,
            success: false,
            output: Value::Null,
            error: Some(error.into()),
        }
    }
}
