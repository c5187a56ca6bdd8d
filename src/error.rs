use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("tool schema must be a JSON object")]
    SchemaNotObject,
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
    #[error("schema does not compile: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown capability '{0}'")]
    NotFound(String),
    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("{0}")]
    Execution(String),
    #[error("nested agent failed: {0}")]
    Nested(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] ProviderError),
    #[error(
        "budget exceeded after {llm_calls} llm calls and {total_tokens} tokens without a usable answer"
    )]
    BudgetExceeded {
        llm_calls: u32,
        total_tokens: u64,
        partial_content: String,
    },
    #[error("final output does not match the requested schema: {reason}")]
    OutputCoercionFailed { reason: String, raw_content: String },
    #[error("agent stream ended without final response")]
    MissingFinalResponse,
    #[error("agent configuration error: {0}")]
    Config(String),
}
