//! Preview strings stored next to completions for list views

use serde_json::Value;

use crate::domain::agent::{AgentInput, AgentOutput};
use crate::domain::completion::AgentCompletion;
use crate::domain::file::File;
use crate::domain::message::{Message, MessageRole};
use crate::domain::tool_call::ToolCallRequest;

pub const DEFAULT_PREVIEW_MAX_LEN: usize = 255;

/// Compact single-line preview of a JSON value
pub fn compute_preview(value: &Value, max_len: usize) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let flat = raw.replace('\n', " ");
    truncate(&flat, max_len)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_len.saturating_sub(1)).collect();
    format!("{cut}…")
}

fn file_preview(file: &File) -> &'static str {
    if file.is_image() == Some(true) {
        "[image]"
    } else if file.is_audio() == Some(true) {
        "[audio]"
    } else if file.is_pdf() == Some(true) {
        "[pdf]"
    } else {
        "[file]"
    }
}

fn capitalize(role: &str) -> String {
    let mut chars = role.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn tool_call_request_preview(requests: &[&ToolCallRequest]) -> String {
    if requests.len() == 1 {
        return format!("Tool: {}", requests[0].preview());
    }
    let previews: Vec<String> = requests.iter().map(|r| r.preview()).collect();
    format!("Tools: [{}]", previews.join(", "))
}

fn message_preview(message: &Message, max_len: usize) -> Option<String> {
    // Reasoning parts lead assistant messages; previews want the payload
    let content = message.content.iter().find(|c| c.reasoning.is_none())?;
    let role = capitalize(message.role.as_str());

    if let Some(file) = &content.file {
        return Some(format!("{role}: {}", file_preview(file)));
    }
    if let Some(text) = &content.text {
        return Some(format!("{role}: {}", compute_preview(&Value::String(text.clone()), max_len)));
    }
    if let Some(object) = &content.object {
        return Some(format!("{role}: {}", compute_preview(object, max_len)));
    }
    if let Some(result) = &content.tool_call_result {
        return Some(format!("Tool: {}", compute_preview(&result.result, max_len)));
    }
    let requests: Vec<&ToolCallRequest> = message.tool_call_request_iterator().collect();
    if !requests.is_empty() {
        return Some(tool_call_request_preview(&requests));
    }
    None
}

fn last_assistant_message_idx(messages: &[Message]) -> Option<usize> {
    messages
        .iter()
        .rposition(|m| m.role == MessageRole::Assistant)
}

/// Preview the newest turn of a message list: the first matching-role message
/// after the last assistant response
fn messages_list_preview(
    messages: Option<&Vec<Message>>,
    include_roles: &[MessageRole],
    max_len: usize,
) -> Option<String> {
    let messages = messages?;
    if messages.is_empty() {
        return None;
    }
    let first_idx = last_assistant_message_idx(messages)
        .map(|i| i + 1)
        .unwrap_or(0);
    let message = messages[first_idx..]
        .iter()
        .find(|m| include_roles.contains(&m.role))
        .unwrap_or(&messages[0]);
    message_preview(message, max_len)
}

fn input_preview(input: &AgentInput) -> String {
    if let Some(variables) = &input.variables {
        let mut preview = compute_preview(variables, DEFAULT_PREVIEW_MAX_LEN);
        if preview.chars().count() < DEFAULT_PREVIEW_MAX_LEN {
            let budget = DEFAULT_PREVIEW_MAX_LEN - preview.chars().count();
            if let Some(second) = messages_list_preview(
                input.messages.as_ref(),
                &[MessageRole::User, MessageRole::Assistant],
                budget,
            ) {
                preview = format!("{preview} | {second}");
            }
        }
        return preview;
    }
    messages_list_preview(
        input.messages.as_ref(),
        &[MessageRole::User],
        DEFAULT_PREVIEW_MAX_LEN,
    )
    .unwrap_or_default()
}

fn output_preview(output: &AgentOutput) -> String {
    if output.messages.is_some() {
        return messages_list_preview(
            output.messages.as_ref(),
            &[MessageRole::Assistant],
            DEFAULT_PREVIEW_MAX_LEN,
        )
        .unwrap_or_default();
    }
    if let Some(error) = &output.error {
        return format!("Error: {}", truncate(&error.message, DEFAULT_PREVIEW_MAX_LEN));
    }
    tracing::error!("completion output has neither messages nor error");
    String::new()
}

pub fn assign_input_preview(input: &mut AgentInput) {
    if input.preview.is_empty() {
        input.preview = input_preview(input);
    }
}

pub fn assign_output_preview(output: &mut AgentOutput) {
    if output.preview.is_empty() {
        output.preview = output_preview(output);
    }
}

/// Fill previews in place, keeping any the caller provided
pub fn assign_run_previews(completion: &mut AgentCompletion) {
    assign_input_preview(&mut completion.agent_input);
    assign_output_preview(&mut completion.agent_output);
}
