pub mod agent_tool;

use std::future::Future;
use std::sync::{Arc, LazyLock};

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::agent::Agent;
use crate::error::{SchemaError, ToolError};
use crate::llm::ToolDefinition;
use crate::message::Metadata;
use crate::schema::{CompiledSchema, permissive_object_schema};

pub use agent_tool::agent_tool;

static PERMISSIVE_SCHEMA: LazyLock<CompiledSchema> = LazyLock::new(|| {
    CompiledSchema::compile(permissive_object_schema()).expect("permissive object schema compiles")
});

type ToolHandler =
    dyn Fn(Value, &Metadata) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync;

/// What actually runs when a tool is invoked.
#[derive(Clone)]
pub(crate) enum ToolBackend {
    Handler(Arc<ToolHandler>),
    Agent(Arc<Agent>),
}

#[derive(Clone)]
pub struct ToolSpec {
    name: String,
    description: String,
    schema: CompiledSchema,
    backend: ToolBackend,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("json_schema", self.schema.raw())
            .field("nested_agent", &self.is_agent())
            .finish()
    }
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: PERMISSIVE_SCHEMA.clone(),
            backend: ToolBackend::Handler(Arc::new(|_args, _metadata| {
                Box::pin(async {
                    Err(ToolError::Execution(
                        "tool handler not configured".to_string(),
                    ))
                })
            })),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, SchemaError> {
        self.schema = CompiledSchema::compile_tool_schema(schema)?;
        Ok(self)
    }

    /// Sets the function executed for this tool. The handler receives the
    /// validated arguments and the run's metadata.
    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value, &Metadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        self.backend = ToolBackend::Handler(Arc::new(move |args, metadata| {
            Box::pin(handler(args, metadata))
        }));
        self
    }

    pub(crate) fn with_agent(mut self, agent: Arc<Agent>) -> Self {
        self.backend = ToolBackend::Agent(agent);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn json_schema(&self) -> &Value {
        self.schema.raw()
    }

    pub fn is_agent(&self) -> bool {
        matches!(self.backend, ToolBackend::Agent(_))
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema.raw().clone(),
        }
    }

    pub fn validate_arguments(&self, args: &Value) -> Result<(), ToolError> {
        if !args.is_object() {
            return Err(ToolError::InvalidArguments {
                tool: self.name.clone(),
                message: "arguments must be a JSON object".to_string(),
            });
        }

        self.schema
            .validate(args)
            .map_err(|message| ToolError::InvalidArguments {
                tool: self.name.clone(),
                message,
            })
    }

    /// Validates `args` and runs the tool.
    pub async fn execute(&self, args: Value, metadata: &Metadata) -> Result<String, ToolError> {
        self.validate_arguments(&args)?;
        self.invoke(args, metadata).await
    }

    /// Runs the tool on arguments the caller has already validated.
    pub(crate) async fn invoke(&self, args: Value, metadata: &Metadata) -> Result<String, ToolError> {
        match &self.backend {
            ToolBackend::Handler(handler) => handler(args, metadata).await,
            ToolBackend::Agent(agent) => {
                agent_tool::run_nested(agent.clone(), args, metadata.clone()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn echo_tool() -> ToolSpec {
        ToolSpec::new("echo", "echo the text back")
            .with_schema(json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
                "additionalProperties": false
            }))
            .expect("schema valid")
            .with_handler(|args, metadata| {
                let suffix = metadata
                    .get("user_id")
                    .and_then(Value::as_str)
                    .map(|user| format!(" [for {user}]"))
                    .unwrap_or_default();
                async move {
                    let text = args
                        .get("text")
                        .and_then(Value::as_str)
                        .ok_or_else(|| ToolError::Execution("text missing".to_string()))?;
                    Ok(format!("{text}{suffix}"))
                }
            })
    }

    #[test]
    fn schema_validation_rejects_non_object_root() {
        let result = ToolSpec::new("bad", "bad").with_schema(json!({"type": "string"}));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn handler_receives_metadata() {
        let mut metadata = Metadata::new();
        metadata.insert("user_id".to_string(), json!("u42"));

        let output = echo_tool()
            .execute(json!({"text": "hi"}), &metadata)
            .await
            .expect("tool executes");
        assert_eq!(output, "hi [for u42]");
    }

    #[tokio::test]
    async fn argument_validation_reports_missing_required() {
        let err = echo_tool()
            .execute(json!({}), &Metadata::new())
            .await
            .expect_err("should fail");

        assert!(matches!(err, ToolError::InvalidArguments { .. }));
        assert!(err.to_string().contains("text"));
    }

    #[tokio::test]
    async fn non_object_arguments_are_rejected() {
        let err = echo_tool()
            .execute(json!("hi"), &Metadata::new())
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("must be a JSON object"));
    }

    #[tokio::test]
    async fn unconfigured_handler_fails() {
        let err = ToolSpec::new("noop", "nothing")
            .execute(json!({}), &Metadata::new())
            .await
            .expect_err("no handler");
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn default_schema_is_shared_and_accepts_any_object() {
        let first = ToolSpec::new("a", "first");
        let second = ToolSpec::new("b", "second");

        assert!(first.schema.shares_validator_with(&second.schema));
        assert!(first.validate_arguments(&json!({"anything": [1, 2]})).is_ok());
        assert_eq!(first.json_schema()["type"], "object");
    }

    #[test]
    fn definition_mirrors_schema() {
        let definition = echo_tool().definition();
        assert_eq!(definition.name, "echo");
        assert_eq!(definition.parameters["required"], json!(["text"]));
    }
}
