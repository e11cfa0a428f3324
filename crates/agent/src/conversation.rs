use parley_core::config::GuardrailMode;
use parley_core::domain::conversation::{ConversationContext, Role, Turn};
use serde_json::Value;

use crate::executor::{ToolCallStatus, ToolExecutionRecord};
use crate::llm::{ChatMessage, GenerationParams, ProviderRequest};
use crate::tools::ToolRegistry;

/// Number of prior turns handed to the model.
pub const HISTORY_WINDOW: usize = 10;

const BASE_INSTRUCTIONS: &str = "You are a helpful customer support assistant. Answer clearly \
and briefly. Only state facts that are given to you in this prompt or by the user.";

const GUIDELINES: &str = "Guidelines:\n\
- If a tool result is provided, base your answer on it and mention the key details.\n\
- If a tool is unavailable, apologise and suggest trying again later.\n\
- If required information is missing, ask for exactly that information.\n\
- Never invent order numbers, dates or statuses.";

/// What the assistant's last turn was waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AwaitingInput {
    Identifier,
    Confirmation,
}

pub(crate) fn normalize_text(text: &str) -> String {
    text.to_lowercase()
}

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_alphanumeric() {
            sanitized.push(character);
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().map(|token| token.to_string()).collect()
}

pub fn awaiting_input(context: &ConversationContext) -> Option<AwaitingInput> {
    let last = context.turns().last().filter(|turn| turn.role == Role::Assistant)?;
    let text = normalize_text(&last.content);
    if !text.contains('?') {
        return None;
    }

    let asks_identifier = ["order number", "tracking number", "order id", "reference number"]
        .iter()
        .any(|phrase| text.contains(phrase));
    if asks_identifier {
        return Some(AwaitingInput::Identifier);
    }

    let asks_confirmation = ["would you like", "shall i", "do you want", "is that correct"]
        .iter()
        .any(|phrase| text.contains(phrase));
    asks_confirmation.then_some(AwaitingInput::Confirmation)
}

/// Grounding note for a tool call. Error detail stays out of the prompt.
pub fn tool_grounding(record: &ToolExecutionRecord) -> String {
    match record.status {
        ToolCallStatus::Success => {
            let output = record.output.as_ref().map(render_value).unwrap_or_default();
            format!("Tool `{}` returned:\n{output}", record.tool_name)
        }
        ToolCallStatus::ValidationError => format!(
            "Tool `{}` could not run because required details were missing or invalid. \
             Ask the user for them.",
            record.tool_name
        ),
        ToolCallStatus::ExecutionError | ToolCallStatus::Timeout => format!(
            "Tool `{}` is currently unavailable. Let the user know and suggest trying again later.",
            record.tool_name
        ),
    }
}

pub fn system_prompt(
    registry: &ToolRegistry,
    mode: GuardrailMode,
    grounding: Option<&ToolExecutionRecord>,
    awaiting: Option<AwaitingInput>,
) -> String {
    let mut sections = vec![BASE_INSTRUCTIONS.to_string()];

    if mode == GuardrailMode::ToolOnly {
        sections.push(
            "Only help with requests that the tools below can handle; politely decline anything \
             else."
                .to_string(),
        );
    }

    if !registry.is_empty() {
        let tools = registry
            .list()
            .map(|spec| format!("- {}: {}", spec.name, spec.description))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Available tools:\n{tools}"));
    }

    if let Some(record) = grounding {
        sections.push(tool_grounding(record));
    }

    match awaiting {
        Some(AwaitingInput::Identifier) => sections.push(
            "You previously asked the user for an order or tracking number; treat their reply \
             as that answer."
                .to_string(),
        ),
        Some(AwaitingInput::Confirmation) => sections.push(
            "You previously asked the user to confirm something; interpret their reply as a \
             yes or no."
                .to_string(),
        ),
        None => {}
    }

    sections.push(GUIDELINES.to_string());
    sections.join("\n\n")
}

pub fn build_request(
    system: String,
    context: &ConversationContext,
    message: &str,
    params: &GenerationParams,
) -> ProviderRequest {
    let mut messages: Vec<ChatMessage> = context
        .recent(HISTORY_WINDOW)
        .iter()
        .filter(|turn| turn.role != Role::System)
        .map(ChatMessage::from)
        .collect();
    messages.push(ChatMessage::from(&Turn::user(message)));

    ProviderRequest {
        system: Some(system),
        messages,
        max_tokens: params.max_tokens,
        temperature: params.temperature,
        top_p: params.top_p,
    }
}

/// Reply used when tool results are returned without model phrasing.
pub fn render_tool_result(record: &ToolExecutionRecord) -> String {
    match record.status {
        ToolCallStatus::Success => {
            let output = record.output.as_ref().map(render_value).unwrap_or_default();
            format!("Here is what {} found:\n{output}", record.tool_name)
        }
        ToolCallStatus::ValidationError => "I need a bit more information to look that up. \
            Could you share the order or tracking number?"
            .to_string(),
        ToolCallStatus::ExecutionError | ToolCallStatus::Timeout => {
            "That lookup is unavailable right now. Please try again in a few minutes.".to_string()
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| match value {
                Value::String(text) => format!("- {key}: {text}"),
                other => format!("- {key}: {other}"),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
