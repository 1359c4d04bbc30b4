//! Tools and the per-context tool registry.
//!
//! A [`Tool`] is a named callable taking a JSON object of arguments. Both
//! synchronous and asynchronous implementations are supported; synchronous
//! tools invoked from an async path are offloaded to the blocking thread
//! pool so long-running work never stalls the cooperative scheduler.
//!
//! Registries are plain values owned by a context. There is no process-wide
//! registry; builders populate a registry from declarative tool packs.

pub mod packs;
pub mod schema;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{Result, TasukiError};

pub use schema::ToolSchema;

/// JSON object of tool arguments.
pub type ToolArgs = serde_json::Map<String, Value>;

type SyncToolFn = Arc<dyn Fn(&ToolArgs) -> Result<Value> + Send + Sync>;
type AsyncToolFn = Arc<dyn Fn(ToolArgs) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Clone)]
enum ToolImpl {
    Sync(SyncToolFn),
    Async(AsyncToolFn),
}

/// A named callable with a JSON-object signature.
#[derive(Clone)]
pub struct Tool {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description shown to the planner.
    pub description: String,
    /// Optional schema for the tool's parameters.
    pub schema: Option<ToolSchema>,
    imp: ToolImpl,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("kind", &match self.imp {
                ToolImpl::Sync(_) => "sync",
                ToolImpl::Async(_) => "async",
            })
            .finish_non_exhaustive()
    }
}

impl Tool {
    /// Create a synchronous tool.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        func: impl Fn(&ToolArgs) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: None,
            imp: ToolImpl::Sync(Arc::new(func)),
        }
    }

    /// Create an asynchronous tool from a future-returning closure.
    #[must_use]
    pub fn new_async(
        name: impl Into<String>,
        description: impl Into<String>,
        func: impl Fn(ToolArgs) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: None,
            imp: ToolImpl::Async(Arc::new(func)),
        }
    }

    /// Attach a parameter schema (builder pattern).
    #[must_use]
    pub fn with_schema(mut self, schema: ToolSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Invoke the tool synchronously.
    ///
    /// # Errors
    ///
    /// Fails if the tool itself fails, or if the tool is asynchronous and
    /// can only be driven through [`Tool::invoke_async`].
    pub fn invoke(&self, args: &ToolArgs) -> Result<Value> {
        match &self.imp {
            ToolImpl::Sync(f) => f(args),
            ToolImpl::Async(_) => Err(TasukiError::tool(
                &self.name,
                "async tool requires invoke_async",
            )),
        }
    }

    /// Invoke the tool from an async context.
    ///
    /// Synchronous implementations are offloaded to the blocking thread pool
    /// so they never block the cooperative scheduler.
    ///
    /// # Errors
    ///
    /// Propagates the tool's own failure.
    pub async fn invoke_async(&self, args: ToolArgs) -> Result<Value> {
        match &self.imp {
            ToolImpl::Sync(f) => {
                let f = Arc::clone(f);
                tokio::task::spawn_blocking(move || f(&args))
                    .await
                    .map_err(|e| TasukiError::internal(format!("blocking task join: {e}")))?
            }
            ToolImpl::Async(f) => f(args).await,
        }
    }
}

/// Maps unique tool names to tools. Registration is last-wins per name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Tool) {
        self.tools.insert(tool.name.clone(), tool);
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    /// Whether the named tool is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All registered tools, in no particular order.
    #[must_use]
    pub fn list(&self) -> Vec<&Tool> {
        self.tools.values().collect()
    }

    /// Registered tool names, sorted for stable output.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Borrow the underlying name-to-tool map.
    #[must_use]
    pub const fn tools(&self) -> &HashMap<String, Tool> {
        &self.tools
    }

    /// Keep only the named tools, dropping the rest.
    pub fn retain_named(&mut self, names: &[&str]) {
        self.tools.retain(|name, _| names.contains(&name.as_str()));
    }
}
