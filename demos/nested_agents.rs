use std::collections::VecDeque;
use std::error::Error;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use tenx_agent::{
    Agent, ChatModel, GenerationResult, Message, Metadata, ProviderError, RunRequest, StopReason,
    ToolCall, ToolDefinition, ToolError, ToolSpec,
};
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct ScriptedModel {
    responses: Mutex<VecDeque<GenerationResult>>,
}

impl ScriptedModel {
    fn new(responses: Vec<GenerationResult>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn generate(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
        _metadata: &Metadata,
    ) -> Result<GenerationResult, ProviderError> {
        self.responses
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .ok_or_else(|| ProviderError::Response("scripted model exhausted responses".to_string()))
    }
}

fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> GenerationResult {
    GenerationResult::new(
        Message::assistant_with_tool_calls("", vec![ToolCall::new(id, name, arguments)]),
        120,
        20,
    )
}

fn answer(text: &str) -> GenerationResult {
    GenerationResult::new(Message::assistant(text), 160, 15)
}

fn multiply_tool() -> ToolSpec {
    ToolSpec::new("multiply", "multiply two integers")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "integer"}
            },
            "required": ["a", "b"],
            "additionalProperties": false
        }))
        .expect("valid schema")
        .with_handler(|args, _metadata| async move {
            let a = args
                .get("a")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ToolError::Execution("a missing".to_string()))?;
            let b = args
                .get("b")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ToolError::Execution("b missing".to_string()))?;
            Ok((a * b).to_string())
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let math_agent = Agent::builder()
        .model(ScriptedModel::new(vec![
            tool_call("inner_1", "multiply", json!({"a": 17, "b": 5})),
            answer("17 * 5 = 85"),
        ]))
        .system_prompt("You solve arithmetic with the multiply tool.")
        .tool(multiply_tool())
        .max_llm_calls(4)
        .build()?
        .into_tool("math_agent", "Delegate an arithmetic question to a specialist agent")?;

    let coordinator = Agent::builder()
        .model(ScriptedModel::new(vec![
            tool_call("outer_1", "math_agent", json!({"query": "What is 17 * 5?"})),
            answer(r#"{"message": "The specialist says 17 * 5 = 85"}"#),
        ]))
        .system_prompt("You coordinate specialists.")
        .tool(math_agent)
        .build()?;

    let mut metadata = Metadata::new();
    metadata.insert("user_id".to_string(), json!("demo-user"));

    let result = coordinator
        .run(
            RunRequest::new("Ask the math agent for 17 * 5")
                .metadata(metadata)
                .output_schema(json!({
                    "type": "object",
                    "properties": {
                        "message": {"type": "string"},
                        "total_tokens": {"type": "integer"}
                    },
                    "required": ["message", "total_tokens"]
                })),
        )
        .await?;

    println!("structured answer: {}", result.content.to_text());
    println!("tools used: {:?}", result.tools_used);
    println!(
        "coordinator usage: {} calls, {} tokens ({} in / {} out)",
        result.llm_calls, result.total_tokens, result.input_tokens, result.output_tokens
    );
    if result.stop_reason == StopReason::BudgetExceeded {
        println!("coordinator stopped on its budget");
    }

    Ok(())
}
