//! Governance policies for tool execution.
//!
//! Each organization is assigned a [`PolicyBundle`] naming denied tools and
//! denied egress domains. The executor consults the [`PolicyEngine`] before
//! every tool call; denials become step failures and are never retried.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::tool::ToolArgs;

/// Tool-level policy: a deny list of tool names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicy {
    /// Tool names that may not be executed.
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Network-egress policy: a deny list of hostnames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressPolicy {
    /// Hostnames egress tools may not reach.
    #[serde(default)]
    pub deny_domains: Vec<String>,
}

/// A per-organization policy bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBundle {
    /// Tool deny rules.
    #[serde(default)]
    pub tools: ToolPolicy,
    /// Egress deny rules.
    #[serde(default)]
    pub egress: EgressPolicy,
}

impl PolicyBundle {
    /// A bundle that denies nothing.
    #[must_use]
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Deny a tool by name (builder pattern).
    #[must_use]
    pub fn deny_tool(mut self, name: impl Into<String>) -> Self {
        self.tools.deny.push(name.into());
        self
    }

    /// Deny egress to a hostname (builder pattern).
    #[must_use]
    pub fn deny_domain(mut self, host: impl Into<String>) -> Self {
        self.egress.deny_domains.push(host.into());
        self
    }
}

/// The outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Allow the tool call.
    Allow,
    /// Deny the tool call with a reason.
    Deny(String),
}

impl Decision {
    /// Whether this decision permits the call.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Prefix that marks a tool as performing network egress.
const EGRESS_TOOL_PREFIX: &str = "http.";

/// Authorizes tool calls against per-organization policy bundles.
///
/// Organizations without an assigned bundle are permitted everything.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    bundles: RwLock<HashMap<String, PolicyBundle>>,
}

impl PolicyEngine {
    /// Create an engine with no assigned bundles.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a bundle to an organization, replacing any previous one.
    pub fn assign(&self, org_id: impl Into<String>, bundle: PolicyBundle) {
        let org_id = org_id.into();
        info!(org = %org_id, "assigned policy bundle");
        self.bundles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(org_id, bundle);
    }

    /// The bundle assigned to an organization, if any.
    #[must_use]
    pub fn bundle_for(&self, org_id: &str) -> Option<PolicyBundle> {
        self.bundles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(org_id)
            .cloned()
    }

    /// Authorize a tool call for the organization.
    ///
    /// Denies when the tool is on the deny list, or when an egress tool
    /// targets a denied host.
    #[must_use]
    pub fn authorize(&self, org_id: &str, tool_name: &str, inputs: &ToolArgs) -> Decision {
        let Some(bundle) = self.bundle_for(org_id) else {
            return Decision::Allow;
        };

        if bundle.tools.deny.iter().any(|denied| denied == tool_name) {
            return Decision::Deny(format!("Policy denied tool '{tool_name}'"));
        }

        if tool_name.starts_with(EGRESS_TOOL_PREFIX)
            && let Some(host) = inputs
                .get("url")
                .and_then(Value::as_str)
                .and_then(extract_host)
            && bundle.egress.deny_domains.iter().any(|d| host_matches(&host, d))
        {
            return Decision::Deny(format!("Policy denied egress to {host}"));
        }

        Decision::Allow
    }
}

/// Pull the hostname out of a URL string.
fn extract_host(raw: &str) -> Option<String> {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
}

/// A host matches a denied domain exactly or as a subdomain of it.
fn host_matches(host: &str, denied: &str) -> bool {
    host == denied || host.ends_with(&format!(".{denied}"))
}
