mod anthropic;
mod manual;
mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProviderError;
use crate::message::{GenerationResult, Message, Metadata};

pub use anthropic::{AnthropicModel, AnthropicModelConfig};
pub(crate) use manual::first_json_object;
pub use manual::{ManualToolCalling, ParsedReply, parse_reply};
pub use openai::{OpenAiModel, OpenAiModelConfig};

/// Tool description handed to a backend.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A language-model backend.
///
/// Implementations perform exactly one model call per `generate` and surface
/// transport failures as [`ProviderError`]; they never retry.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        metadata: &Metadata,
    ) -> Result<GenerationResult, ProviderError>;
}

/// The two supported tool-calling dialects.
#[derive(Clone)]
pub enum ModelAdapter {
    /// The backend accepts tool definitions and returns structured calls.
    Native(Arc<dyn ChatModel>),
    /// Tools are described in the prompt and calls are parsed from text.
    Manual(ManualToolCalling),
}

impl std::fmt::Debug for ModelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native(_) => f.write_str("ModelAdapter::Native"),
            Self::Manual(_) => f.write_str("ModelAdapter::Manual"),
        }
    }
}

impl ModelAdapter {
    pub fn native<M>(model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        Self::Native(Arc::new(model))
    }

    pub fn manual<M>(model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        Self::Manual(ManualToolCalling::new(model))
    }

    pub fn supports_native_tool_calling(&self) -> bool {
        matches!(self, Self::Native(_))
    }

    /// The system prompt this adapter sends for the given tools.
    pub fn tool_calling_system_prompt(&self, tools: &[ToolDefinition], user_prompt: &str) -> String {
        match self {
            Self::Native(_) => user_prompt.to_string(),
            Self::Manual(manual) => manual.tool_calling_system_prompt(tools, user_prompt),
        }
    }

    pub async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        metadata: &Metadata,
    ) -> Result<GenerationResult, ProviderError> {
        match self {
            Self::Native(model) => model.generate(messages, tools, metadata).await,
            Self::Manual(manual) => manual.generate(messages, tools, metadata).await,
        }
    }
}
