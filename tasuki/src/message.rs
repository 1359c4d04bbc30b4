//! Message types for agent communication.
//!
//! Every artifact an agent produces or consumes is a [`Message`]: the user
//! task, the serialized plan, and each per-step observation. Messages are
//! immutable once emitted; the runtime stamps run metadata before a message
//! enters history and the stamp never changes afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Metadata key carrying the session identifier.
pub const META_SESSION_ID: &str = "session_id";
/// Metadata key carrying the run identifier.
pub const META_RUN_ID: &str = "run_id";
/// Metadata key carrying the message kind (`plan`, `execution_step`, ...).
pub const META_TYPE: &str = "type";

/// Role of a message within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message originating from the end user.
    User,
    /// Message produced by an agent.
    Agent,
    /// System-level message.
    System,
}

impl Role {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

/// An immutable message with open key/value metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: String,
    /// Who produced the message.
    pub role: Role,
    /// Message body.
    pub content: String,
    /// Open metadata bag; the runtime stamps `session_id`, `run_id`, `type`.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Message {
    /// Create a message with a fresh unique id and empty metadata.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    /// Create a message with an initial metadata bag.
    #[must_use]
    pub fn with_metadata(
        role: Role,
        content: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            metadata,
        }
    }

    /// Attach a metadata entry (builder pattern).
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Get a metadata value as a string slice, if present and textual.
    #[must_use]
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// The session this message belongs to, if stamped.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.meta_str(META_SESSION_ID)
    }

    /// The run this message belongs to, if stamped.
    #[must_use]
    pub fn run_id(&self) -> Option<&str> {
        self.meta_str(META_RUN_ID)
    }

    /// The message kind (`plan`, `execution_step`, `execution`), if stamped.
    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        self.meta_str(META_TYPE)
    }
}
