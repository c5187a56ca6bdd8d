use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ProviderError;
use crate::llm::{ChatModel, ToolDefinition};
use crate::message::{GenerationResult, Message, Metadata, Role, ToolCall};

const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiModelConfig {
    pub api_key: String,
    pub model: String,
    pub api_base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl OpenAiModelConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            api_base_url: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Native tool-calling backend for OpenAI-compatible chat completion APIs.
///
/// Two metadata keys are forwarded as request parameters when present:
/// `user` (string) and `seed` (integer). Everything else is ignored.
#[derive(Debug, Clone)]
pub struct OpenAiModel {
    client: Client,
    config: OpenAiModelConfig,
}

impl OpenAiModel {
    pub fn new(config: OpenAiModelConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    /// Reads `OPENAI_API_KEY` and, if set, `OPENAI_BASE_URL`.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ProviderError::Request("OPENAI_API_KEY is not set".to_string()))?;

        let mut config = OpenAiModelConfig::new(api_key, model);
        config.api_base_url = std::env::var("OPENAI_BASE_URL").ok();
        Self::new(config)
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl ChatModel for OpenAiModel {
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        metadata: &Metadata,
    ) -> Result<GenerationResult, ProviderError> {
        let request = build_request(messages, tools, metadata, &self.config);
        debug!(model = %self.config.model, messages = messages.len(), "chat completion request");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(extract_api_error(response).await));
        }

        let payload = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|err| ProviderError::Response(err.to_string()))?;

        normalize_response(payload)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<RequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<FunctionTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum RequestMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct FunctionTool {
    #[serde(rename = "type")]
    type_: &'static str,
    function: FunctionDefinition,
}

#[derive(Debug, Serialize)]
struct FunctionDefinition {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    type_: String,
    function: WireFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<AssistantMessage>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
}

fn build_request(
    messages: &[Message],
    tools: &[ToolDefinition],
    metadata: &Metadata,
    config: &OpenAiModelConfig,
) -> ChatCompletionRequest {
    let tools_payload = (!tools.is_empty()).then(|| {
        tools
            .iter()
            .map(|tool| FunctionTool {
                type_: "function",
                function: FunctionDefinition {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect::<Vec<_>>()
    });

    ChatCompletionRequest {
        model: config.model.clone(),
        messages: messages.iter().map(to_request_message).collect(),
        tool_choice: tools_payload.as_ref().map(|_| "auto".to_string()),
        tools: tools_payload,
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        user: metadata
            .get("user")
            .and_then(Value::as_str)
            .map(str::to_string),
        seed: metadata.get("seed").and_then(Value::as_i64),
    }
}

fn to_request_message(message: &Message) -> RequestMessage {
    match message.role {
        Role::System => RequestMessage::System {
            content: message.content.clone(),
        },
        Role::User => RequestMessage::User {
            content: message.content.clone(),
        },
        Role::Assistant => {
            let tool_calls = message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    type_: function_type(),
                    function: WireFunctionCall {
                        name: call.name.clone(),
                        arguments: match &call.arguments {
                            Value::String(raw) => raw.clone(),
                            other => other.to_string(),
                        },
                    },
                })
                .collect::<Vec<_>>();

            RequestMessage::Assistant {
                content: Some(message.content.clone()).filter(|text| !text.is_empty()),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            }
        }
        Role::Tool => RequestMessage::Tool {
            tool_call_id: message.tool_call_id.clone().unwrap_or_default(),
            content: message.content.clone(),
        },
    }
}

fn normalize_response(response: ChatCompletionResponse) -> Result<GenerationResult, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Response("response missing choices".to_string()))?;

    let message = choice
        .message
        .ok_or_else(|| ProviderError::Response("response missing choice message".to_string()))?;

    let mut tool_calls = Vec::with_capacity(message.tool_calls.len());
    for call in message.tool_calls {
        // Unparseable arguments stay as the raw string; argument validation
        // turns them into a tool error the model can correct.
        let arguments = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str::<Value>(&call.function.arguments).unwrap_or_else(|err| {
                debug!(
                    tool = %call.function.name,
                    error = %err,
                    "tool call arguments are not valid JSON"
                );
                Value::String(call.function.arguments.clone())
            })
        };
        tool_calls.push(ToolCall::new(call.id, call.function.name, arguments));
    }

    let (input_tokens, output_tokens) = response
        .usage
        .map(|usage| {
            (
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));

    Ok(GenerationResult::new(
        Message::assistant_with_tool_calls(message.content.unwrap_or_default(), tool_calls),
        input_tokens,
        output_tokens,
    ))
}

async fn extract_api_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if let Ok(parsed) = serde_json::from_str::<ErrorEnvelope>(&body) {
        let error_type = parsed.error.type_.unwrap_or_else(|| status.to_string());
        let message = parsed
            .error
            .message
            .unwrap_or_else(|| "unknown api error".to_string());
        return format!("api error {error_type} ({status}): {message}");
    }

    if body.is_empty() {
        format!("api request failed ({status})")
    } else {
        format!("api request failed ({status}): {body}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> ToolDefinition {
        ToolDefinition {
            name: "calculator".to_string(),
            description: "Evaluates arithmetic".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"expression": {"type": "string"}},
                "required": ["expression"]
            }),
        }
    }

    #[test]
    fn build_request_serializes_conversation_tools_and_metadata() {
        let messages = vec![
            Message::system("You are helpful"),
            Message::user("2+2?"),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("call_1", "calculator", json!({"expression": "2+2"}))],
            ),
            Message::tool("call_1", "Result: 4"),
        ];

        let mut metadata = Metadata::new();
        metadata.insert("user".to_string(), json!("user123"));
        metadata.insert("seed".to_string(), json!(42));
        metadata.insert("precision".to_string(), json!(4));

        let mut config = OpenAiModelConfig::new("key", "gpt-4o-mini");
        config.temperature = Some(0.1);

        let request = build_request(&messages, &[calculator()], &metadata, &config);
        let value = serde_json::to_value(request).expect("serializes");

        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][2]["role"], "assistant");
        assert!(value["messages"][2].get("content").is_none());
        assert_eq!(
            value["messages"][2]["tool_calls"][0]["function"]["arguments"],
            "{\"expression\":\"2+2\"}"
        );
        assert_eq!(value["messages"][3]["role"], "tool");
        assert_eq!(value["messages"][3]["tool_call_id"], "call_1");
        assert_eq!(value["tools"][0]["function"]["name"], "calculator");
        assert_eq!(value["tool_choice"], "auto");
        assert_eq!(value["user"], "user123");
        assert_eq!(value["seed"], 42);
        assert!(value.get("precision").is_none());
    }

    #[test]
    fn build_request_omits_tools_when_none_registered() {
        let request = build_request(
            &[Message::user("hi")],
            &[],
            &Metadata::new(),
            &OpenAiModelConfig::new("key", "gpt-4o-mini"),
        );
        let value = serde_json::to_value(request).expect("serializes");
        assert!(value.get("tools").is_none());
        assert!(value.get("tool_choice").is_none());
        assert!(value.get("user").is_none());
    }

    #[test]
    fn normalize_response_extracts_calls_and_usage() {
        let payload: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_x",
                        "type": "function",
                        "function": {"name": "calculator", "arguments": "{\"expression\":\"15*23\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 40, "completion_tokens": 9}
        }))
        .expect("payload deserializes");

        let result = normalize_response(payload).expect("normalizes");
        assert_eq!(result.message.tool_calls[0].id, "call_x");
        assert_eq!(
            result.message.tool_calls[0].arguments,
            json!({"expression": "15*23"})
        );
        assert_eq!(result.input_tokens, 40);
        assert_eq!(result.output_tokens, 9);
    }

    #[test]
    fn normalize_response_reports_zero_usage_when_missing() {
        let payload: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "hello"}}]
        }))
        .expect("payload deserializes");

        let result = normalize_response(payload).expect("normalizes");
        assert_eq!(result.message.content, "hello");
        assert_eq!((result.input_tokens, result.output_tokens), (0, 0));
    }

    #[test]
    fn normalize_response_keeps_calls_with_invalid_arguments() {
        let payload: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"tool_calls": [{
                "id": "call_x",
                "function": {"name": "calculator", "arguments": "{\"expression\": \"2+2\""}
            }]}}]
        }))
        .expect("payload deserializes");

        let result = normalize_response(payload).expect("normalizes");
        let call = &result.message.tool_calls[0];
        assert_eq!(call.name, "calculator");
        assert_eq!(call.arguments, json!("{\"expression\": \"2+2\""));

        // The raw text goes back to the API unchanged.
        let RequestMessage::Assistant { tool_calls, .. } = to_request_message(&result.message) else {
            panic!("expected assistant message")
        };
        assert_eq!(
            tool_calls.expect("tool calls kept")[0].function.arguments,
            "{\"expression\": \"2+2\""
        );
    }

    #[test]
    fn normalize_response_requires_choices() {
        let payload: ChatCompletionResponse =
            serde_json::from_value(json!({"choices": []})).expect("payload deserializes");
        let err = normalize_response(payload).expect_err("should fail");
        assert!(err.to_string().contains("missing choices"));
    }
}
