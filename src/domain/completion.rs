//! The completion record: one provider call end to end

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::{Agent, AgentInput, AgentOutput};
use crate::domain::hashing::uuid7_generation_time;
use crate::domain::message::Message;
use crate::domain::usage::LLMUsage;
use crate::domain::version::Version;

/// Where a completion originated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionSource {
    Web,
    #[default]
    Api,
    Mcp,
}

impl CompletionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionSource::Web => "web",
            CompletionSource::Api => "api",
            CompletionSource::Mcp => "mcp",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    #[default]
    Success,
    Failure,
}

/// A sub-step within a completion: one LLM attempt or one tool invocation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Trace {
    Llm {
        model: String,
        provider: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<LLMUsage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
    },
    Tool {
        name: String,
        tool_input_preview: String,
        tool_output_preview: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
    },
}

impl Trace {
    pub fn duration_seconds(&self) -> Option<f64> {
        match self {
            Trace::Llm {
                duration_seconds, ..
            }
            | Trace::Tool {
                duration_seconds, ..
            } => *duration_seconds,
        }
    }

    pub fn cost_usd(&self) -> Option<f64> {
        match self {
            Trace::Llm { cost_usd, .. } | Trace::Tool { cost_usd, .. } => *cost_usd,
        }
    }
}

/// Immutable record of one completion. Created by the runner, persisted by a
/// background task, never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentCompletion {
    pub id: Uuid,
    pub agent: Agent,
    pub agent_input: AgentInput,
    pub agent_output: AgentOutput,
    /// Fully resolved messages as sent to the provider
    #[serde(default)]
    pub messages: Vec<Message>,
    pub version: Version,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub traces: Vec<Trace>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub source: CompletionSource,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub status: CompletionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl AgentCompletion {
    /// Creation time is carried by the UUIDv7 id, not a separate column
    pub fn created_at(&self) -> DateTime<Utc> {
        uuid7_generation_time(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::hashing::uuid7;
    use crate::domain::message::MessageRole;

    fn completion() -> AgentCompletion {
        AgentCompletion {
            id: uuid7(),
            agent: Agent::new("assistant"),
            agent_input: AgentInput::default(),
            agent_output: AgentOutput {
                messages: Some(vec![Message::with_text(MessageRole::Assistant, "42")]),
                ..Default::default()
            },
            messages: vec![],
            version: Version {
                model: "gpt-4.1".to_string(),
                ..Default::default()
            },
            duration_seconds: Some(1.2),
            cost_usd: Some(0.0003),
            traces: vec![],
            metadata: BTreeMap::new(),
            source: CompletionSource::Api,
            stream: false,
            from_cache: false,
            status: CompletionStatus::Success,
            conversation_id: None,
        }
    }

    #[test]
    fn test_created_at_from_uuid7() {
        let c = completion();
        let age = Utc::now().signed_duration_since(c.created_at());
        assert!(age.num_seconds().abs() < 5);
    }

    #[test]
    fn test_trace_tagged_serialization() {
        let trace = Trace::Llm {
            model: "gpt-4.1".to_string(),
            provider: "openai".to_string(),
            usage: None,
            duration_seconds: Some(0.8),
            cost_usd: Some(0.0001),
        };
        let value = serde_json::to_value(&trace).unwrap();
        assert_eq!(value["kind"], "llm");

        let parsed: Trace = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, trace);
    }

    #[test]
    fn test_completion_roundtrip() {
        let c = completion();
        let json = serde_json::to_string(&c).unwrap();
        let parsed: AgentCompletion = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, c);
    }
}
