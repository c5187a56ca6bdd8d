use anthropic_ai_sdk::client::AnthropicClient;
use anthropic_ai_sdk::types::message::{
    ContentBlock, CreateMessageParams, CreateMessageResponse, Message as AnthropicMessage,
    MessageClient, MessageError, RequiredMessageParams, Role as AnthropicRole, Thinking,
    ThinkingType, Tool, ToolChoice,
};
use async_trait::async_trait;
use tracing::debug;

use crate::error::ProviderError;
use crate::llm::{ChatModel, ToolDefinition};
use crate::message::{GenerationResult, Message, Metadata, Role, ToolCall};

#[derive(Debug, Clone)]
/// Runtime configuration for [`AnthropicModel`].
pub struct AnthropicModelConfig {
    /// Anthropic API key.
    pub api_key: String,
    /// Model id (for example `claude-sonnet-4-5`).
    pub model: String,
    /// Anthropic API version header value.
    pub api_version: String,
    /// Optional base URL override for proxies or compatible endpoints.
    pub api_base_url: Option<String>,
    /// Maximum output tokens per call.
    pub max_tokens: u32,
    /// Optional sampling temperature.
    pub temperature: Option<f32>,
    /// Optional budget for extended thinking tokens.
    pub thinking_budget_tokens: Option<usize>,
}

impl AnthropicModelConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            api_version: AnthropicClient::DEFAULT_API_VERSION.to_string(),
            api_base_url: None,
            max_tokens: 4096,
            temperature: None,
            thinking_budget_tokens: None,
        }
    }
}

/// Native tool-calling backend for the Anthropic Messages API.
#[derive(Debug, Clone)]
pub struct AnthropicModel {
    client: AnthropicClient,
    config: AnthropicModelConfig,
}

impl AnthropicModel {
    pub fn new(config: AnthropicModelConfig) -> Result<Self, ProviderError> {
        let mut builder =
            AnthropicClient::builder(config.api_key.clone(), config.api_version.clone());
        if let Some(url) = &config.api_base_url {
            builder = builder.with_api_base_url(url.clone());
        }

        let client = builder
            .build::<MessageError>()
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    /// Reads `ANTHROPIC_API_KEY` from the environment.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ProviderError::Request("ANTHROPIC_API_KEY is not set".to_string()))?;
        Self::new(AnthropicModelConfig::new(api_key, model))
    }
}

#[async_trait]
impl ChatModel for AnthropicModel {
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        _metadata: &Metadata,
    ) -> Result<GenerationResult, ProviderError> {
        let (history, system) = to_anthropic_messages(messages);

        let required = RequiredMessageParams {
            model: self.config.model.clone(),
            messages: history,
            max_tokens: self.config.max_tokens,
        };

        let mut request = CreateMessageParams::new(required).with_stream(false);

        if let Some(system_prompt) = system {
            request = request.with_system(system_prompt);
        }

        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }

        if let Some(budget_tokens) = self.config.thinking_budget_tokens {
            request = request.with_thinking(Thinking {
                budget_tokens,
                type_: ThinkingType::Enabled,
            });
        }

        if !tools.is_empty() {
            let anthropic_tools = tools
                .iter()
                .map(|tool| Tool {
                    name: tool.name.clone(),
                    description: Some(tool.description.clone()),
                    input_schema: tool.parameters.clone(),
                })
                .collect::<Vec<_>>();

            request = request
                .with_tools(anthropic_tools)
                .with_tool_choice(ToolChoice::Auto);
        }

        debug!(model = %self.config.model, messages = messages.len(), "anthropic request");

        let response = self
            .client
            .create_message(Some(&request))
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(normalize_response(&response))
    }
}

fn to_anthropic_messages(messages: &[Message]) -> (Vec<AnthropicMessage>, Option<String>) {
    let mut system_lines = Vec::new();
    let mut anthropic_messages = Vec::new();
    // Results answering one assistant turn must travel in a single user turn.
    let mut pending_results = Vec::new();

    for message in messages {
        if message.role != Role::Tool && !pending_results.is_empty() {
            anthropic_messages.push(AnthropicMessage::new_blocks(
                AnthropicRole::User,
                std::mem::take(&mut pending_results),
            ));
        }

        match message.role {
            Role::System => system_lines.push(message.content.clone()),
            Role::User => {
                anthropic_messages.push(AnthropicMessage::new_text(
                    AnthropicRole::User,
                    message.content.clone(),
                ));
            }
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(ContentBlock::Text {
                        text: message.content.clone(),
                    });
                }
                for call in &message.tool_calls {
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.arguments.clone(),
                    });
                }
                if !blocks.is_empty() {
                    anthropic_messages.push(AnthropicMessage::new_blocks(
                        AnthropicRole::Assistant,
                        blocks,
                    ));
                }
            }
            Role::Tool => pending_results.push(ContentBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: message.content.clone(),
            }),
        }
    }

    if !pending_results.is_empty() {
        anthropic_messages.push(AnthropicMessage::new_blocks(
            AnthropicRole::User,
            pending_results,
        ));
    }

    let system = if system_lines.is_empty() {
        None
    } else {
        Some(system_lines.join("\n\n"))
    };

    (anthropic_messages, system)
}

fn normalize_response(response: &CreateMessageResponse) -> GenerationResult {
    let mut text_parts = Vec::new();
    let mut thinking_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in &response.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text.clone()),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::new(id.clone(), name.clone(), input.clone()))
            }
            ContentBlock::Thinking { thinking, .. } => thinking_parts.push(thinking.clone()),
            ContentBlock::RedactedThinking { data } => {
                thinking_parts.push(format!("[redacted:{} bytes]", data.len()))
            }
            _ => {}
        }
    }

    let message = Message::assistant_with_tool_calls(text_parts.join("\n"), tool_calls);
    let result = GenerationResult::new(
        message,
        response.usage.input_tokens,
        response.usage.output_tokens,
    );

    if thinking_parts.is_empty() {
        result
    } else {
        result.with_thinking(thinking_parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use anthropic_ai_sdk::types::message::{MessageContent, StopReason};
    use serde_json::json;

    use super::*;

    fn response(content: Vec<ContentBlock>) -> CreateMessageResponse {
        CreateMessageResponse {
            content,
            id: "msg_1".to_string(),
            model: "claude-test".to_string(),
            role: AnthropicRole::Assistant,
            stop_reason: Some(StopReason::ToolUse),
            stop_sequence: None,
            type_: "message".to_string(),
            usage: anthropic_ai_sdk::types::message::Usage {
                input_tokens: 21,
                output_tokens: 8,
            },
        }
    }

    #[test]
    fn normalize_response_extracts_tool_calls_text_and_usage() {
        let result = normalize_response(&response(vec![
            ContentBlock::Text {
                text: "Looking up".to_string(),
            },
            ContentBlock::ToolUse {
                id: "call_1".to_string(),
                name: "search".to_string(),
                input: json!({"query": "rust"}),
            },
        ]));

        assert_eq!(result.message.content, "Looking up");
        assert_eq!(result.message.tool_calls.len(), 1);
        assert_eq!(result.message.tool_calls[0].name, "search");
        assert_eq!(result.input_tokens, 21);
        assert_eq!(result.output_tokens, 8);
        assert!(result.thinking.is_none());
    }

    #[test]
    fn normalize_response_keeps_thinking() {
        let result = normalize_response(&response(vec![ContentBlock::Thinking {
            thinking: "I should call a tool".to_string(),
            signature: "sig".to_string(),
        }]));

        assert!(result.message.content.is_empty());
        assert_eq!(result.thinking.as_deref(), Some("I should call a tool"));
    }

    #[test]
    fn consecutive_tool_results_share_one_user_turn() {
        let history = vec![
            Message::system("sys"),
            Message::user("u1"),
            Message::assistant_with_tool_calls(
                "",
                vec![
                    ToolCall::new("call_1", "search", json!({})),
                    ToolCall::new("call_2", "search", json!({})),
                ],
            ),
            Message::tool("call_1", "first"),
            Message::tool("call_2", "Error: failed"),
            Message::assistant("done"),
        ];

        let (messages, system) = to_anthropic_messages(&history);
        assert_eq!(system.as_deref(), Some("sys"));
        assert_eq!(messages.len(), 4);

        let MessageContent::Blocks { content } = &messages[2].content else {
            panic!("expected blocks")
        };
        assert_eq!(content.len(), 2);
        assert_eq!(
            content[1],
            ContentBlock::ToolResult {
                tool_use_id: "call_2".to_string(),
                content: "Error: failed".to_string(),
            }
        );
    }
}
