use std::collections::HashMap;
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{AgentError, SchemaError, ToolError};
use crate::llm::{ChatModel, ModelAdapter, ToolDefinition};
use crate::message::{Message, Metadata, TokenUsage, ToolCall};
use crate::output::OutputCoercer;
use crate::session::{SessionGuard, SessionStore};
use crate::tools::{ToolSpec, agent_tool};

/// Session used when a run names neither a session nor an explicit history.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Limits and prompt for an [`Agent`]. Deserializable so hosts can embed it
/// in their own configuration files; missing fields take the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub system_prompt: Option<String>,
    /// Maximum model calls per run.
    pub max_llm_calls: u32,
    /// Maximum input plus output tokens per run.
    pub max_tokens: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_llm_calls: 10,
            max_tokens: 4000,
        }
    }
}

/// One call to [`Agent::run`].
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub query: String,
    pub session_id: Option<String>,
    /// When set the run is stateless: the session store is neither read nor
    /// written and this history is used instead.
    pub history: Option<Vec<Message>>,
    pub metadata: Metadata,
    pub output_schema: Option<Value>,
}

impl RunRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn history(mut self, history: Vec<Message>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

impl From<&str> for RunRequest {
    fn from(query: &str) -> Self {
        Self::new(query)
    }
}

impl From<String> for RunRequest {
    fn from(query: String) -> Self {
        Self::new(query)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RunContent {
    Text(String),
    Structured(Value),
}

impl RunContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Structured(_) => None,
        }
    }

    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            Self::Text(_) => None,
            Self::Structured(value) => Some(value),
        }
    }

    /// Text as-is, structured values rendered as compact JSON.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(value) => value.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    BudgetExceeded,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunResult {
    pub content: RunContent,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Names of the tools executed, in execution order.
    pub tools_used: Vec<String>,
    pub llm_calls: u32,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Thinking {
        content: String,
    },
    Text {
        content: String,
    },
    ToolCall {
        tool: String,
        args_json: Value,
        tool_call_id: String,
    },
    ToolResult {
        tool: String,
        result_text: String,
        tool_call_id: String,
        is_error: bool,
    },
    BudgetExceeded {
        llm_calls: u32,
        total_tokens: u64,
    },
    FinalResponse {
        result: RunResult,
    },
}

pub struct AgentBuilder {
    model: Option<ModelAdapter>,
    tools: Vec<ToolSpec>,
    config: AgentConfig,
    sessions: Option<Arc<SessionStore>>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            model: None,
            tools: Vec::new(),
            config: AgentConfig::default(),
            sessions: None,
        }
    }
}

impl AgentBuilder {
    /// Uses a backend with native structured tool calling.
    pub fn model<M>(mut self, model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.model = Some(ModelAdapter::native(model));
        self
    }

    /// Uses a plain text backend; tools are described in the prompt and
    /// calls are parsed from the reply.
    pub fn manual_model<M>(mut self, model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.model = Some(ModelAdapter::manual(model));
        self
    }

    pub fn adapter(mut self, adapter: ModelAdapter) -> Self {
        self.model = Some(adapter);
        self
    }

    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn max_llm_calls(mut self, max_llm_calls: u32) -> Self {
        self.config.max_llm_calls = max_llm_calls;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u64) -> Self {
        self.config.max_tokens = max_tokens;
        self
    }

    /// Shares a session store with other agents. Without one the agent gets
    /// a private store.
    pub fn session_store(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(model) = self.model else {
            return Err(AgentError::Config(
                "agent model must be configured via AgentBuilder::model(...)".to_string(),
            ));
        };

        if self.config.max_llm_calls == 0 {
            return Err(AgentError::Config(
                "max_llm_calls must be at least 1".to_string(),
            ));
        }

        let mut tool_map = HashMap::new();
        for tool in &self.tools {
            if tool_map
                .insert(tool.name().to_string(), tool.clone())
                .is_some()
            {
                return Err(AgentError::Config(format!(
                    "duplicate tool registered: {}",
                    tool.name()
                )));
            }
        }

        let definitions = self.tools.iter().map(ToolSpec::definition).collect();

        Ok(Agent {
            model,
            tools: self.tools,
            tool_map,
            definitions,
            config: self.config,
            sessions: self.sessions.unwrap_or_default(),
        })
    }
}

pub struct Agent {
    model: ModelAdapter,
    tools: Vec<ToolSpec>,
    tool_map: HashMap<String, ToolSpec>,
    definitions: Vec<ToolDefinition>,
    config: AgentConfig,
    sessions: Arc<SessionStore>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.model)
            .field("tools", &self.tools)
            .field("config", &self.config)
            .finish()
    }
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn supports_native_tool_calling(&self) -> bool {
        self.model.supports_native_tool_calling()
    }

    /// The system prompt the backend actually receives, including any tool
    /// instructions added by the manual dialect.
    pub fn effective_system_prompt(&self) -> String {
        let user_prompt = self.config.system_prompt.as_deref().unwrap_or_default();
        self.model
            .tool_calling_system_prompt(&self.definitions, user_prompt)
    }

    /// Wraps this agent as a tool taking a single `query` argument.
    pub fn into_tool(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<ToolSpec, SchemaError> {
        agent_tool(self, name, description)
    }

    pub async fn run(&self, request: impl Into<RunRequest>) -> Result<RunResult, AgentError> {
        let stream = self.run_stream(request);
        futures_util::pin_mut!(stream);

        let mut final_result: Option<RunResult> = None;

        while let Some(event) = stream.next().await {
            match event? {
                AgentEvent::FinalResponse { result } => final_result = Some(result),
                AgentEvent::Thinking { .. }
                | AgentEvent::Text { .. }
                | AgentEvent::ToolCall { .. }
                | AgentEvent::ToolResult { .. }
                | AgentEvent::BudgetExceeded { .. } => {}
            }
        }

        final_result.ok_or(AgentError::MissingFinalResponse)
    }

    pub fn run_stream(
        &self,
        request: impl Into<RunRequest>,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
        let RunRequest {
            query,
            session_id,
            history,
            metadata,
            output_schema,
        } = request.into();

        try_stream! {
            let coercer = output_schema
                .map(OutputCoercer::new)
                .transpose()
                .map_err(|err| AgentError::Config(format!("invalid output schema: {err}")))?;

            let mut conversation = Vec::new();
            if let Some(system_prompt) = self.config.system_prompt.as_ref().filter(|p| !p.is_empty()) {
                conversation.push(Message::system(system_prompt.clone()));
            }

            let mut session = match history {
                Some(history) => {
                    conversation.extend(history);
                    None
                }
                None => {
                    let session_id = session_id.as_deref().unwrap_or(DEFAULT_SESSION_ID);
                    let guard = self.sessions.lock(session_id).await;
                    conversation.extend_from_slice(guard.messages());
                    Some(guard)
                }
            };

            record(&mut conversation, &mut session, Message::user(query));

            let mut usage = TokenUsage::default();
            let mut llm_calls = 0u32;
            let mut tools_used = Vec::new();
            let mut best_content = String::new();

            loop {
                let generation = self
                    .model
                    .generate(&conversation, &self.definitions, &metadata)
                    .await?;

                llm_calls += 1;
                usage.record(&generation);
                let budget_exhausted = llm_calls >= self.config.max_llm_calls
                    || usage.total_tokens() > self.config.max_tokens;

                debug!(
                    llm_calls,
                    input_tokens = generation.input_tokens,
                    output_tokens = generation.output_tokens,
                    tool_calls = generation.message.tool_calls.len(),
                    "generation complete"
                );

                if let Some(thinking) = generation.thinking {
                    yield AgentEvent::Thinking { content: thinking };
                }

                let message = generation.message;
                if !message.content.is_empty() {
                    best_content = message.content.clone();
                    yield AgentEvent::Text {
                        content: message.content.clone(),
                    };
                }

                if !message.has_tool_calls() {
                    let final_text = message.content.clone();
                    record(&mut conversation, &mut session, message);

                    let content = match &coercer {
                        None => RunContent::Text(final_text),
                        Some(coercer) => {
                            let value = coercer.coerce(&final_text, &usage).map_err(|reason| {
                                AgentError::OutputCoercionFailed {
                                    reason,
                                    raw_content: final_text.clone(),
                                }
                            })?;
                            RunContent::Structured(value)
                        }
                    };

                    info!(llm_calls, total_tokens = usage.total_tokens(), "run completed");
                    yield AgentEvent::FinalResponse {
                        result: run_result(content, &usage, tools_used, llm_calls, StopReason::Completed),
                    };
                    return;
                }

                let tool_calls = message.tool_calls.clone();
                record(&mut conversation, &mut session, message);

                for tool_call in tool_calls {
                    yield AgentEvent::ToolCall {
                        tool: tool_call.name.clone(),
                        args_json: tool_call.arguments.clone(),
                        tool_call_id: tool_call.id.clone(),
                    };

                    let execution = if budget_exhausted {
                        ToolExecution::error(format!(
                            "Error: budget exhausted before '{}' could run",
                            tool_call.name
                        ))
                    } else {
                        self.execute_tool_call(&tool_call, &metadata).await
                    };

                    if execution.executed {
                        tools_used.push(tool_call.name.clone());
                    }

                    record(
                        &mut conversation,
                        &mut session,
                        Message::tool(tool_call.id.clone(), execution.result_text.clone()),
                    );

                    yield AgentEvent::ToolResult {
                        tool: tool_call.name.clone(),
                        result_text: execution.result_text,
                        tool_call_id: tool_call.id.clone(),
                        is_error: execution.is_error,
                    };
                }

                if budget_exhausted {
                    warn!(
                        llm_calls,
                        total_tokens = usage.total_tokens(),
                        max_llm_calls = self.config.max_llm_calls,
                        max_tokens = self.config.max_tokens,
                        "run budget exhausted"
                    );
                    yield AgentEvent::BudgetExceeded {
                        llm_calls,
                        total_tokens: usage.total_tokens(),
                    };

                    let content = match &coercer {
                        None => RunContent::Text(best_content.clone()),
                        Some(coercer) => {
                            let value = coercer.coerce(&best_content, &usage).map_err(|_| {
                                AgentError::BudgetExceeded {
                                    llm_calls,
                                    total_tokens: usage.total_tokens(),
                                    partial_content: best_content.clone(),
                                }
                            })?;
                            RunContent::Structured(value)
                        }
                    };

                    yield AgentEvent::FinalResponse {
                        result: run_result(content, &usage, tools_used, llm_calls, StopReason::BudgetExceeded),
                    };
                    return;
                }
            }
        }
    }

    async fn execute_tool_call(&self, tool_call: &ToolCall, metadata: &Metadata) -> ToolExecution {
        let Some(tool) = self.tool_map.get(&tool_call.name) else {
            warn!(tool = %tool_call.name, "model requested unknown tool");
            let err = ToolError::NotFound(tool_call.name.clone());
            return ToolExecution::error(format!("Error: {err}"));
        };

        if let Err(err) = tool.validate_arguments(&tool_call.arguments) {
            warn!(tool = %tool_call.name, error = %err, "rejected tool arguments");
            return ToolExecution::error(format!("Error: {err}"));
        }

        debug!(tool = %tool_call.name, tool_call_id = %tool_call.id, "executing tool");
        match tool.invoke(tool_call.arguments.clone(), metadata).await {
            Ok(text) => ToolExecution {
                result_text: text,
                is_error: false,
                executed: true,
            },
            Err(err) => {
                warn!(tool = %tool_call.name, error = %err, "tool execution failed");
                ToolExecution {
                    result_text: format!("Error: {err}"),
                    is_error: true,
                    executed: true,
                }
            }
        }
    }
}

fn record(conversation: &mut Vec<Message>, session: &mut Option<SessionGuard>, message: Message) {
    if let Some(guard) = session {
        guard.append(message.clone());
    }
    conversation.push(message);
}

fn run_result(
    content: RunContent,
    usage: &TokenUsage,
    tools_used: Vec<String>,
    llm_calls: u32,
    stop_reason: StopReason,
) -> RunResult {
    RunResult {
        content,
        total_tokens: usage.total_tokens(),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        tools_used,
        llm_calls,
        stop_reason,
    }
}

struct ToolExecution {
    result_text: String,
    is_error: bool,
    executed: bool,
}

impl ToolExecution {
    fn error(result_text: String) -> Self {
        Self {
            result_text,
            is_error: true,
            executed: false,
        }
    }
}
