//! Messages and their content parts

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::file::File;
use crate::domain::tool_call::{ToolCallRequest, ToolCallResult};
use crate::error::ApiError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// One part of a message. Exactly one field must be set; anything else is a
/// structural error rejected at intake.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Structured output payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<File>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_request: Option<ToolCallRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_result: Option<ToolCallResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn file(file: File) -> Self {
        Self {
            file: Some(file),
            ..Default::default()
        }
    }

    fn set_field_count(&self) -> usize {
        [
            self.object.is_some(),
            self.text.is_some(),
            self.file.is_some(),
            self.tool_call_request.is_some(),
            self.tool_call_result.is_some(),
            self.reasoning.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    /// Exactly-one-field invariant
    pub fn validate(&self) -> Result<(), ApiError> {
        match self.set_field_count() {
            1 => Ok(()),
            0 => Err(ApiError::bad_request("Message content part has no field set")),
            n => Err(ApiError::bad_request(format!(
                "Message content part has {n} fields set, expected exactly one"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<MessageContent>,
    /// Id of the completion that generated this message, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl Message {
    pub fn with_text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![MessageContent::text(text)],
            run_id: None,
        }
    }

    pub fn with_file_url(role: MessageRole, url: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![MessageContent::file(File::from_url(url))],
            run_id: None,
        }
    }

    pub fn has_files(&self) -> bool {
        self.content.iter().any(|c| c.file.is_some())
    }

    pub fn file_iterator(&self) -> impl Iterator<Item = &File> {
        self.content.iter().filter_map(|c| c.file.as_ref())
    }

    pub fn file_iterator_mut(&mut self) -> impl Iterator<Item = &mut File> {
        self.content.iter_mut().filter_map(|c| c.file.as_mut())
    }

    pub fn tool_call_request_iterator(&self) -> impl Iterator<Item = &ToolCallRequest> {
        self.content.iter().filter_map(|c| c.tool_call_request.as_ref())
    }

    /// Concatenated text parts
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        for content in &self.content {
            content.validate()?;
        }
        Ok(())
    }
}

/// Validate a whole prompt, failing fast on the first bad part
pub fn validate_messages(messages: &[Message]) -> Result<(), ApiError> {
    for message in messages {
        message.validate()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exactly_one_field_invariant() {
        let valid = MessageContent::text("hello");
        assert!(valid.validate().is_ok());

        let empty = MessageContent::default();
        assert!(empty.validate().is_err());

        let double = MessageContent {
            text: Some("hello".to_string()),
            reasoning: Some("because".to_string()),
            ..Default::default()
        };
        let err = double.validate().unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::BadRequest);
    }

    #[test]
    fn test_file_iterator_and_has_files() {
        let message = Message {
            role: MessageRole::User,
            content: vec![
                MessageContent::text("look at this"),
                MessageContent::file(File::from_url("https://example.com/cat.png")),
            ],
            run_id: None,
        };
        assert!(message.has_files());
        assert_eq!(message.file_iterator().count(), 1);

        let plain = Message::with_text(MessageRole::User, "hello");
        assert!(!plain.has_files());
    }

    #[test]
    fn test_tool_call_request_iterator() {
        let message = Message {
            role: MessageRole::Assistant,
            content: vec![MessageContent {
                tool_call_request: Some(ToolCallRequest {
                    index: None,
                    id: "call_1".to_string(),
                    tool_name: "get_weather".to_string(),
                    tool_input: json!({}),
                }),
                ..Default::default()
            }],
            run_id: None,
        };
        assert_eq!(message.tool_call_request_iterator().count(), 1);
    }

    #[test]
    fn test_role_serialization_lowercase() {
        let message = Message::with_text(MessageRole::System, "be brief");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["role"], "system");
    }

    #[test]
    fn test_text_content_joins_parts() {
        let message = Message {
            role: MessageRole::User,
            content: vec![MessageContent::text("a"), MessageContent::text("b")],
            run_id: None,
        };
        assert_eq!(message.text_content(), "a\n\nb");
    }
}
