//! Tool call requests and results exchanged with models

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::services::previews::compute_preview;

/// A model's request to invoke a tool
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
}

impl ToolCallRequest {
    pub fn preview(&self) -> String {
        format!(
            "{}({})",
            self.tool_name,
            compute_preview(&self.tool_input, 120)
        )
    }
}

/// The result of a tool invocation, fed back to the model
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How the model is allowed to pick tools
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    #[serde(untagged)]
    Function {
        name: String,
    },
}

/// A tool the model may call. Hosted tools are referenced by an `@`-prefixed
/// name with no parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

impl ToolDefinition {
    pub fn is_hosted(&self) -> bool {
        self.name.starts_with('@')
    }
}
