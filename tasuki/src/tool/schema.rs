//! Tool schemas: generation, wire formats, and input validation.
//!
//! A [`ToolSchema`] describes a tool's parameters as a JSON-schema object.
//! Schemas are derived from typed parameter structs via [`schemars`] or
//! assembled by hand, and serialize into the three wire shapes providers
//! expect: OpenAI function-calling, Anthropic tool-use, and raw JSON schema.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Result, TasukiError};

/// Schema definition for a tool that LLMs can understand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool identifier.
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON-schema property map for input parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Names of required parameters.
    #[serde(default)]
    pub required: Vec<String>,
    /// Optional JSON schema for the tool output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl ToolSchema {
    /// Create an empty schema with no parameters.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Map::new(),
            required: Vec::new(),
            output_schema: None,
        }
    }

    /// Derive a schema from a typed parameter struct.
    ///
    /// The struct's fields become properties; non-optional fields become
    /// required parameters.
    #[must_use]
    pub fn from_params<T: JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let root = schemars::schema_for!(T);
        let value = serde_json::to_value(&root).unwrap_or_default();

        let parameters = value
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let required = value
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            required,
            output_schema: None,
        }
    }

    /// Add a parameter with an explicit JSON-schema fragment (builder pattern).
    #[must_use]
    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        schema: Value,
        required: bool,
    ) -> Self {
        let name = name.into();
        if required {
            self.required.push(name.clone());
        }
        self.parameters.insert(name, schema);
        self
    }

    /// Attach an output schema (builder pattern).
    #[must_use]
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Serialize to the OpenAI function-calling wire shape.
    #[must_use]
    pub fn to_openai_format(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": self.parameters,
                    "required": self.required,
                }
            }
        })
    }

    /// Serialize to the Anthropic tool-use wire shape.
    #[must_use]
    pub fn to_anthropic_format(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": {
                "type": "object",
                "properties": self.parameters,
                "required": self.required,
            }
        })
    }

    /// Serialize to a raw JSON-schema object.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        json!({
            "type": "object",
            "title": self.name,
            "description": self.description,
            "properties": self.parameters,
            "required": self.required,
        })
    }

    /// Rebuild a schema from its raw JSON-schema form.
    ///
    /// Inverse of [`ToolSchema::to_json_schema`], ignoring field order.
    ///
    /// # Errors
    ///
    /// Fails when the value is not an object schema with a title.
    pub fn from_json_schema(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| TasukiError::parsing("tool schema must be a JSON object"))?;
        if object.get("type").and_then(Value::as_str) != Some("object") {
            return Err(TasukiError::parsing("tool schema must have type \"object\""));
        }
        let name = object
            .get("title")
            .and_then(Value::as_str)
            .ok_or_else(|| TasukiError::parsing("tool schema missing title"))?;
        let description = object
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let parameters = object
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let required = object
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            name: name.to_owned(),
            description: description.to_owned(),
            parameters,
            required,
            output_schema: None,
        })
    }

    /// Validate an argument object against the schema.
    ///
    /// Returns `true` iff every required key is present and every supplied
    /// key whose property declares a JSON type matches it nominally.
    /// Unknown keys and untyped properties are accepted.
    #[must_use]
    pub fn validate(&self, args: &Map<String, Value>) -> bool {
        for required in &self.required {
            if !args.contains_key(required) {
                return false;
            }
        }
        for (key, value) in args {
            let Some(declared) = self.parameters.get(key) else {
                continue;
            };
            let Some(expected) = declared.get("type").and_then(Value::as_str) else {
                continue;
            };
            if !value_matches_type(value, expected) {
                return false;
            }
        }
        true
    }
}

/// Nominal JSON type check: a value matches the declared type keyword.
fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}
