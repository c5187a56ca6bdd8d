//! Conversational agent runtime.
//!
//! - `Agent` loop that alternates model calls and tool executions under a
//!   per-run budget of calls and tokens
//! - `SessionStore` keeping per-session history, with runs on the same
//!   session serialized
//! - Native and prompt-based (manual) tool calling behind one `ModelAdapter`
//! - Agents usable as tools of other agents via `agent_tool`
//! - Optional coercion of the final answer into a caller-supplied JSON schema

pub mod agent;
pub mod error;
pub mod llm;
pub mod message;
pub mod output;
pub mod schema;
pub mod session;
pub mod tools;

pub use agent::{
    Agent, AgentBuilder, AgentConfig, AgentEvent, DEFAULT_SESSION_ID, RunContent, RunRequest,
    RunResult, StopReason,
};
pub use error::{AgentError, ProviderError, SchemaError, ToolError};
pub use llm::{
    AnthropicModel, AnthropicModelConfig, ChatModel, ManualToolCalling, ModelAdapter, OpenAiModel,
    OpenAiModelConfig, ParsedReply, ToolDefinition, parse_reply,
};
pub use message::{GenerationResult, Message, Metadata, Role, TokenUsage, ToolCall};
pub use output::OutputCoercer;
pub use session::{SessionGuard, SessionStore};
pub use tools::{ToolSpec, agent_tool};
