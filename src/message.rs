//! Conversation entities shared by the session store, the model adapters and
//! the agent loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque key-value bag threaded from [`crate::RunRequest`] into every
/// generation and tool execution. The runtime never inspects it.
pub type Metadata = serde_json::Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// One entry of a conversation.
///
/// Assistant messages may carry `tool_calls`; tool messages carry the
/// `tool_call_id` of the request they answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Output of a single model call. Usage is always reported; backends that
/// cannot count tokens report zero.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationResult {
    pub message: Message,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub thinking: Option<String>,
}

impl GenerationResult {
    pub fn new(message: Message, input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            message,
            input_tokens,
            output_tokens,
            thinking: None,
        }
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }

    pub fn total_tokens(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }
}

/// Token totals accumulated over a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn record(&mut self, result: &GenerationResult) {
        self.input_tokens += u64::from(result.input_tokens);
        self.output_tokens += u64::from(result.output_tokens);
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_serializes_without_empty_tool_fields() {
        let value = serde_json::to_value(Message::user("hi")).expect("serializes");
        assert_eq!(value, json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn tool_message_round_trips_correlation_id() {
        let message: Message = serde_json::from_value(json!({
            "role": "tool",
            "content": "Result: 4",
            "tool_call_id": "call_1"
        }))
        .expect("deserializes");

        assert_eq!(message, Message::tool("call_1", "Result: 4"));
    }
}
