//! Builtin presets and the preset-to-runtime builder.
//!
//! A preset bundles a model selection, a list of tool packs, and memory
//! bounds. [`build_runtime_from_preset`] resolves the packs against a
//! caller-supplied tool registry and wires up a ready
//! [`PlannerExecutorRuntime`].

use std::sync::Arc;

use crate::context::AgentContext;
use crate::error::{Result, TasukiError};
use crate::executor::ExecutorAgent;
use crate::llm::LlmClient;
use crate::model::ModelConfig;
use crate::planner::PlannerAgent;
use crate::runtime::PlannerExecutorRuntime;
use crate::tool::{ToolRegistry, packs::pack_tools};

/// A named agent configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PresetDefinition {
    /// Preset name.
    pub name: &'static str,
    /// What the preset is for.
    pub description: &'static str,
    /// Model selection.
    pub model: ModelConfig,
    /// Tool packs resolved into the contexts.
    pub tool_packs: &'static [&'static str],
    /// Short-term history bound.
    pub max_short_term: usize,
    /// Long-term history bound.
    pub max_long_term: usize,
}

/// Names of all builtin presets.
#[must_use]
pub const fn preset_names() -> [&'static str; 4] {
    [
        "assistant_basic",
        "assistant_tools",
        "assistant_rag",
        "assistant_multiagent",
    ]
}

/// Look up a builtin preset by name.
#[must_use]
pub fn get_preset(name: &str) -> Option<PresetDefinition> {
    let preset = match name {
        "assistant_basic" => PresetDefinition {
            name: "assistant_basic",
            description: "Simple assistant with minimal tooling and memory.",
            model: ModelConfig::new("default", "openai", "gpt-4")
                .with_temperature(0.3)
                .with_max_tokens(1024),
            tool_packs: &["core"],
            max_short_term: 200,
            max_long_term: 2000,
        },
        "assistant_tools" => PresetDefinition {
            name: "assistant_tools",
            description: "Tool-using assistant with expanded tool pack.",
            model: ModelConfig::new("default", "openai", "gpt-4")
                .with_temperature(0.2)
                .with_max_tokens(2048),
            tool_packs: &["core", "utilities"],
            max_short_term: 400,
            max_long_term: 4000,
        },
        "assistant_rag" => PresetDefinition {
            name: "assistant_rag",
            description: "Retrieval-augmented assistant with semantic memory.",
            model: ModelConfig::new("default", "openai", "gpt-4")
                .with_temperature(0.2)
                .with_max_tokens(2048),
            tool_packs: &["core", "rag"],
            max_short_term: 400,
            max_long_term: 8000,
        },
        "assistant_multiagent" => PresetDefinition {
            name: "assistant_multiagent",
            description: "Multi-agent setup with coordination defaults.",
            model: ModelConfig::new("default", "openai", "gpt-4")
                .with_temperature(0.2)
                .with_max_tokens(2048),
            tool_packs: &["core", "utilities", "coordination"],
            max_short_term: 300,
            max_long_term: 3000,
        },
        _ => return None,
    };
    Some(preset)
}

/// Keep only the tools the preset's packs name.
///
/// An empty resolution keeps the registry as-is so ad-hoc registries still
/// work without pack manifests.
fn resolve_tools(registry: &ToolRegistry, tool_packs: &[&str]) -> ToolRegistry {
    let pack_names: Vec<&str> = tool_packs
        .iter()
        .filter_map(|pack| pack_tools(pack))
        .flatten()
        .copied()
        .collect();

    let mut resolved = registry.clone();
    if !pack_names.is_empty() {
        resolved.retain_named(&pack_names);
    }
    if resolved.is_empty() {
        return registry.clone();
    }
    resolved
}

/// Build a planner/executor runtime from a named preset.
///
/// Both contexts share the preset's model and memory bounds; tools come
/// from the supplied registry filtered to the preset's packs.
///
/// # Errors
///
/// Fails when the preset name is unknown.
pub fn build_runtime_from_preset(
    preset_name: &str,
    llm_client: Arc<dyn LlmClient>,
    tools: &ToolRegistry,
) -> Result<PlannerExecutorRuntime> {
    let preset = get_preset(preset_name)
        .ok_or_else(|| TasukiError::configuration(format!("unknown preset '{preset_name}'")))?;

    let resolved = resolve_tools(tools, preset.tool_packs);

    let planner_context = AgentContext::new()
        .with_model_config(preset.model.clone())
        .with_memory_bounds(preset.max_short_term, preset.max_long_term)
        .with_tools(&resolved);
    let executor_context = AgentContext::new()
        .with_model_config(preset.model)
        .with_memory_bounds(preset.max_short_term, preset.max_long_term)
        .with_tools(&resolved);

    Ok(PlannerExecutorRuntime::new(
        PlannerAgent::new("planner", planner_context, Arc::clone(&llm_client)),
        ExecutorAgent::new("executor", executor_context, llm_client),
    ))
}
