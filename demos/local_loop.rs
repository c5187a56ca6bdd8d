use std::collections::VecDeque;
use std::error::Error;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tenx_agent::{
    Agent, AgentEvent, ChatModel, GenerationResult, Message, Metadata, ProviderError, RunRequest,
    ToolDefinition, ToolError, ToolSpec,
};
use tracing_subscriber::EnvFilter;

/// Plain text backend replaying canned replies. Tool requests are written in
/// the JSON convention the manual dialect teaches the model.
#[derive(Default)]
struct ScriptedTextModel {
    replies: Mutex<VecDeque<&'static str>>,
}

impl ScriptedTextModel {
    fn new(replies: Vec<&'static str>) -> Self {
        Self {
            replies: Mutex::new(VecDeque::from(replies)),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedTextModel {
    async fn generate(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
        _metadata: &Metadata,
    ) -> Result<GenerationResult, ProviderError> {
        let reply = self
            .replies
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .ok_or_else(|| ProviderError::Response("scripted model exhausted replies".to_string()))?;

        let prompt_chars = messages
            .iter()
            .map(|message| message.content.len())
            .sum::<usize>();
        let input_tokens = u32::try_from(prompt_chars / 4).unwrap_or(u32::MAX);
        let output_tokens = u32::try_from(reply.len() / 4).unwrap_or(u32::MAX);
        Ok(GenerationResult::new(
            Message::assistant(reply),
            input_tokens,
            output_tokens,
        ))
    }
}

fn calculator_tool() -> ToolSpec {
    ToolSpec::new("calculator", "evaluate a binary arithmetic operation")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "operation": {"type": "string", "enum": ["add", "subtract", "multiply", "divide"]},
                "a": {"type": "number"},
                "b": {"type": "number"}
            },
            "required": ["operation", "a", "b"],
            "additionalProperties": false
        }))
        .expect("valid schema")
        .with_handler(|args, _metadata| async move {
            let a = args
                .get("a")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| ToolError::Execution("a missing".to_string()))?;
            let b = args
                .get("b")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| ToolError::Execution("b missing".to_string()))?;
            let value = match args.get("operation").and_then(|v| v.as_str()) {
                Some("add") => a + b,
                Some("subtract") => a - b,
                Some("multiply") => a * b,
                Some("divide") if b == 0.0 => {
                    return Err(ToolError::Execution("division by zero".to_string()));
                }
                Some("divide") => a / b,
                other => {
                    return Err(ToolError::Execution(format!(
                        "unsupported operation: {other:?}"
                    )));
                }
            };
            Ok(format!("Result: {value}"))
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let agent = Agent::builder()
        .manual_model(ScriptedTextModel::new(vec![
            r#"{"tool_calls": [{"name": "calculator", "arguments": {"operation": "multiply", "a": 15, "b": 23}}]}"#,
            "15 * 23 = 345",
            "Sure, I will add 10 to that.\n```json\n{\"tool_calls\": [{\"name\": \"calculator\", \"arguments\": {\"operation\": \"add\", \"a\": 345, \"b\": 10}}]}\n```",
            "345 + 10 = 355",
            "Your first question was about 15 * 23.",
        ]))
        .system_prompt("You are a precise arithmetic assistant.")
        .tool(calculator_tool())
        .build()?;

    println!("system prompt sent to the backend:\n{}\n", agent.effective_system_prompt());

    let first = agent
        .run(RunRequest::new("What is 15 * 23?").session("demo"))
        .await?;
    println!(
        "run 1: {} (tools={:?}, llm_calls={}, tokens={})",
        first.content.to_text(),
        first.tools_used,
        first.llm_calls,
        first.total_tokens
    );

    let stream = agent.run_stream(RunRequest::new("Now add 10 to it.").session("demo"));
    futures_util::pin_mut!(stream);
    while let Some(event) = stream.next().await {
        match event? {
            AgentEvent::Thinking { content } => println!("thinking: {content}"),
            AgentEvent::Text { content } => println!("text: {content}"),
            AgentEvent::ToolCall {
                tool,
                args_json,
                tool_call_id,
            } => println!("tool call [{tool_call_id}] {tool}: {args_json}"),
            AgentEvent::ToolResult {
                tool,
                result_text,
                tool_call_id,
                is_error,
            } => println!("tool result [{tool_call_id}] {tool}: {result_text} (error={is_error})"),
            AgentEvent::BudgetExceeded {
                llm_calls,
                total_tokens,
            } => println!("budget exceeded after {llm_calls} calls, {total_tokens} tokens"),
            AgentEvent::FinalResponse { result } => {
                println!("stream final: {}", result.content.to_text())
            }
        }
    }

    let recall = agent
        .run(RunRequest::new("What was my first question?").session("demo"))
        .await?;
    println!("run 3: {}", recall.content.to_text());
    println!(
        "session 'demo' holds {} messages",
        agent.sessions().len("demo").await
    );

    Ok(())
}
