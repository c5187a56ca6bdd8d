//! Exposes an [`Agent`] as a tool of another agent.
//!
//! The inner agent runs to completion on a private session that is discarded
//! afterwards, so the caller only ever sees the final text. Its token usage
//! stays with the inner run.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::{Agent, RunRequest, StopReason};
use crate::error::{SchemaError, ToolError};
use crate::message::Metadata;
use crate::tools::ToolSpec;

/// Builds a tool whose single required `query` argument is forwarded to
/// `agent`.
pub fn agent_tool(
    agent: impl Into<Arc<Agent>>,
    name: impl Into<String>,
    description: impl Into<String>,
) -> Result<ToolSpec, SchemaError> {
    let tool = ToolSpec::new(name, description).with_schema(json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "The request to hand to the nested agent."
            }
        },
        "required": ["query"],
        "additionalProperties": false
    }))?;

    Ok(tool.with_agent(agent.into()))
}

// Boxed so the agent loop and this call do not form an infinitely sized
// future type.
pub(crate) fn run_nested(
    agent: Arc<Agent>,
    args: Value,
    metadata: Metadata,
) -> BoxFuture<'static, Result<String, ToolError>> {
    Box::pin(async move {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments {
                tool: "agent".to_string(),
                message: "query must be a string".to_string(),
            })?
            .to_string();

        let session_id = format!("nested-{}", Uuid::new_v4());
        debug!(session_id = %session_id, "starting nested agent run");

        let outcome = agent
            .run(
                RunRequest::new(query)
                    .session(session_id.clone())
                    .metadata(metadata),
            )
            .await;
        agent.sessions().remove(&session_id).await;

        let result = outcome.map_err(|err| {
            warn!(session_id = %session_id, error = %err, "nested agent run failed");
            ToolError::Nested(err.to_string())
        })?;

        if result.stop_reason == StopReason::BudgetExceeded {
            debug!(session_id = %session_id, "nested agent stopped on budget");
        }

        Ok(result.content.to_text())
    })
}
