//! Agents and the content-addressed input/output pair of a completion

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::hashing::hash_content;
use crate::domain::message::Message;

/// A named scope under which completions are grouped
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    /// Relational row id; 0 until the agent is stored
    #[serde(default)]
    pub uid: i64,
}

impl Agent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uid: 0,
        }
    }
}

/// The caller-supplied side of a completion: template variables and/or
/// messages. Content-addressed for cache lookups and experiment dedup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInput {
    #[serde(default)]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default)]
    pub preview: String,
}

impl AgentInput {
    pub fn compute_id(&self) -> String {
        let value = serde_json::json!({
            "variables": self.variables,
            "messages": self.messages,
        });
        hash_content(&value)
    }

    pub fn reset_id(&mut self) {
        self.id = self.compute_id();
    }
}

/// Structured error stored with a failed completion
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// What the model produced, or the error that prevented it
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    #[serde(default)]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OutputError>,
    #[serde(default)]
    pub preview: String,
}

impl AgentOutput {
    pub fn compute_id(&self) -> String {
        let value = serde_json::json!({
            "messages": self.messages,
            "error": self.error,
        });
        hash_content(&value)
    }

    pub fn reset_id(&mut self) {
        self.id = self.compute_id();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::MessageRole;
    use serde_json::json;

    #[test]
    fn test_input_id_deterministic_over_preview() {
        let mut a = AgentInput {
            variables: Some(json!({"name": "Toulouse"})),
            ..Default::default()
        };
        let mut b = a.clone();
        b.preview = "Name: Toulouse".to_string();
        a.reset_id();
        b.reset_id();
        // Preview is presentation only, it never affects the address
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_input_id_changes_with_variables() {
        let a = AgentInput {
            variables: Some(json!({"name": "Toulouse"})),
            ..Default::default()
        };
        let b = AgentInput {
            variables: Some(json!({"name": "Lyon"})),
            ..Default::default()
        };
        assert_ne!(a.compute_id(), b.compute_id());
    }

    #[test]
    fn test_output_id_covers_error() {
        let ok = AgentOutput {
            messages: Some(vec![Message::with_text(MessageRole::Assistant, "42")]),
            ..Default::default()
        };
        let failed = AgentOutput {
            error: Some(OutputError {
                message: "boom".to_string(),
                code: Some("internal_error".to_string()),
            }),
            ..Default::default()
        };
        assert_ne!(ok.compute_id(), failed.compute_id());
    }
}
