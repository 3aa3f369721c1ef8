//! Versions: the full, content-addressed prompt configuration

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::hashing::hash_content;
use crate::domain::message::Message;
use crate::domain::models::ProviderId;
use crate::domain::tool_call::{ToolChoice, ToolDefinition};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Disabled,
    Low,
    Medium,
    High,
}

/// A complete prompt configuration. The id is derived from the canonical
/// JSON of every other field, so identical configurations share an id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Version {
    #[serde(default)]
    pub id: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Vec<Message>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    /// Names of hosted tools enabled for the version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_variables_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_budget: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_structured_generation: Option<bool>,
}

impl Version {
    /// Content-address the version. The id field itself never participates.
    pub fn compute_id(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("id");
        }
        hash_content(&value)
    }

    pub fn reset_id(&mut self) {
        self.id = self.compute_id();
    }

    /// Deterministic versions are safe to serve from cache without being
    /// asked: no sampling noise means identical inputs give identical
    /// outputs.
    pub fn should_use_auto_cache(&self) -> bool {
        self.temperature.unwrap_or(0.0) == 0.0
    }
}
