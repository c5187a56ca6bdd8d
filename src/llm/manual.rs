//! Prompt-based tool calling for backends without structured tool support.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ProviderError;
use crate::llm::{ChatModel, ToolDefinition};
use crate::message::{GenerationResult, Message, Metadata, Role, ToolCall};

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n?(.*?)\s*```\s*$").expect("code fence regex is valid")
});

/// Wraps a plain text backend and teaches it a JSON convention for tool calls.
#[derive(Clone)]
pub struct ManualToolCalling {
    inner: Arc<dyn ChatModel>,
}

impl ManualToolCalling {
    pub fn new<M>(model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        Self {
            inner: Arc::new(model),
        }
    }

    pub fn from_arc(model: Arc<dyn ChatModel>) -> Self {
        Self { inner: model }
    }

    pub fn tool_calling_system_prompt(&self, tools: &[ToolDefinition], user_prompt: &str) -> String {
        if tools.is_empty() {
            return user_prompt.to_string();
        }

        let mut prompt = String::new();
        if !user_prompt.trim().is_empty() {
            prompt.push_str(user_prompt.trim_end());
            prompt.push_str("\n\n");
        }

        prompt.push_str("You have access to the following tools:\n");
        for tool in tools {
            prompt.push_str(&format!(
                "- {}: {}\n  arguments schema: {}\n",
                tool.name, tool.description, tool.parameters
            ));
        }
        prompt.push_str(
            "\nTo use a tool, reply with a single JSON object and nothing else, in this format:\n\
             {\"tool_calls\": [{\"name\": \"<tool name>\", \"arguments\": {<arguments>}}]}\n\
             You may request several tools at once by adding more entries to tool_calls. \
             Tool results will be sent back to you. When you do not need a tool, \
             answer the user directly in plain text without any JSON.",
        );
        prompt
    }

    pub async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        metadata: &Metadata,
    ) -> Result<GenerationResult, ProviderError> {
        let rendered = self.render_messages(messages, tools);
        let result = self.inner.generate(&rendered, &[], metadata).await?;

        let parsed = parse_reply(&result.message.content);
        debug!(
            tool_calls = parsed.tool_calls.len(),
            "parsed manual tool-calling reply"
        );

        Ok(GenerationResult {
            message: Message::assistant_with_tool_calls(parsed.content, parsed.tool_calls),
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            thinking: result.thinking,
        })
    }

    /// Flattens the conversation into roles a plain backend understands:
    /// one leading system message, earlier tool calls restated in the JSON
    /// convention and tool results delivered as user turns.
    fn render_messages(&self, messages: &[Message], tools: &[ToolDefinition]) -> Vec<Message> {
        let system_prompt = messages
            .iter()
            .filter(|message| message.role == Role::System)
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let system_prompt = self.tool_calling_system_prompt(tools, &system_prompt);

        let mut rendered = Vec::with_capacity(messages.len() + 1);
        if !system_prompt.is_empty() {
            rendered.push(Message::system(system_prompt));
        }

        let mut call_names = HashMap::new();
        for message in messages {
            match message.role {
                Role::System => {}
                Role::User => rendered.push(Message::user(message.content.clone())),
                Role::Assistant => {
                    if message.tool_calls.is_empty() {
                        rendered.push(Message::assistant(message.content.clone()));
                        continue;
                    }

                    for call in &message.tool_calls {
                        call_names.insert(call.id.clone(), call.name.clone());
                    }
                    let calls = message
                        .tool_calls
                        .iter()
                        .map(|call| json!({"name": call.name, "arguments": call.arguments}))
                        .collect::<Vec<_>>();
                    let convention = json!({ "tool_calls": calls }).to_string();
                    let content = if message.content.trim().is_empty() {
                        convention
                    } else {
                        format!("{}\n{convention}", message.content.trim_end())
                    };
                    rendered.push(Message::assistant(content));
                }
                Role::Tool => {
                    let id = message.tool_call_id.as_deref().unwrap_or("unknown");
                    let name = call_names.get(id).map(String::as_str).unwrap_or("tool");
                    rendered.push(Message::user(format!(
                        "Tool '{name}' returned (call {id}):\n{}",
                        message.content
                    )));
                }
            }
        }

        rendered
    }
}

/// Result of reading a manual-dialect reply.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Recovers tool calls from model text. Never fails: text that carries no
/// usable `tool_calls` object is returned unchanged as a plain answer.
pub fn parse_reply(text: &str) -> ParsedReply {
    let plain = || ParsedReply {
        content: text.to_string(),
        tool_calls: Vec::new(),
    };

    let whole = CODE_FENCE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map_or(text, |inner| inner.as_str());

    if let Ok(value) = serde_json::from_str::<Value>(whole.trim()) {
        let tool_calls = extract_tool_calls(&value);
        if tool_calls.is_empty() {
            return plain();
        }
        return ParsedReply {
            content: String::new(),
            tool_calls,
        };
    }

    let Some((start, end, value)) = first_json_object(text) else {
        return plain();
    };

    let tool_calls = extract_tool_calls(&value);
    if tool_calls.is_empty() {
        return plain();
    }

    let mut remainder = String::with_capacity(text.len());
    remainder.push_str(&text[..start]);
    remainder.push_str(&text[end..]);
    ParsedReply {
        content: CODE_FENCE
            .replace_all(remainder.trim(), "")
            .trim()
            .trim_matches('`')
            .trim()
            .to_string(),
        tool_calls,
    }
}

/// Finds the first `{...}` span that is balanced and parses as a JSON object.
/// Returns its byte range and the parsed value.
///
/// Single pass over the text. Spans are only parsed once the brace group
/// they belong to closes (or the text ends), earliest start first.
pub(crate) fn first_json_object(text: &str) -> Option<(usize, usize, Value)> {
    let mut open = Vec::new();
    let mut closed = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (index, byte) in text.bytes().enumerate() {
        if in_string {
            match (escaped, byte) {
                (true, _) => escaped = false,
                (false, b'\\') => escaped = true,
                (false, b'"') => in_string = false,
                _ => {}
            }
            continue;
        }

        match byte {
            // Quotes in prose outside any brace group are not JSON strings.
            b'"' if !open.is_empty() => in_string = true,
            b'{' => open.push(index),
            b'}' => {
                let Some(start) = open.pop() else {
                    continue;
                };
                closed.push((start, index + 1));
                if open.is_empty() {
                    if let Some(found) = parse_first_object(text, &mut closed) {
                        return Some(found);
                    }
                }
            }
            _ => {}
        }
    }

    parse_first_object(text, &mut closed)
}

/// Tries `spans` in start order and empties the list.
fn parse_first_object(text: &str, spans: &mut Vec<(usize, usize)>) -> Option<(usize, usize, Value)> {
    spans.sort_unstable_by_key(|(start, _)| *start);
    spans
        .drain(..)
        .find_map(|(start, end)| match serde_json::from_str::<Value>(&text[start..end]) {
            Ok(value @ Value::Object(_)) => Some((start, end, value)),
            _ => None,
        })
}

fn extract_tool_calls(value: &Value) -> Vec<ToolCall> {
    let Some(entries) = value.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut used_ids = HashSet::new();
    let mut tool_calls = Vec::new();

    for entry in entries {
        // Accept both the flat convention and the nested `function` shape
        // some models imitate from structured APIs.
        let source = entry.get("function").filter(|f| f.is_object()).unwrap_or(entry);
        let Some(name) = source.get("name").and_then(Value::as_str) else {
            continue;
        };
        if name.trim().is_empty() {
            continue;
        }

        let arguments = match source.get("arguments") {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
                Ok(parsed @ Value::Object(_)) => parsed,
                _ => json!({}),
            },
            _ => json!({}),
        };

        let requested_id = entry
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty() && !used_ids.contains(*id))
            .map(str::to_string);
        let id = requested_id.unwrap_or_else(|| {
            let mut counter = tool_calls.len() + 1;
            loop {
                let candidate = format!("call_{counter}");
                if !used_ids.contains(&candidate) {
                    break candidate;
                }
                counter += 1;
            }
        });

        used_ids.insert(id.clone());
        tool_calls.push(ToolCall::new(id, name, arguments));
    }

    tool_calls
}
