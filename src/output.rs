//! Turns a final free-text answer into a value matching a caller's schema.
//!
//! Recovery order: the whole text as JSON, then the first JSON object
//! embedded in the text, then the raw text wrapped into the schema's text
//! field. Integer `total_tokens` / `input_tokens` / `output_tokens`
//! properties the answer leaves out are filled from the run's usage. When
//! nothing validates the caller gets [`crate::AgentError::OutputCoercionFailed`]
//! carrying the raw text.

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::SchemaError;
use crate::llm::first_json_object;
use crate::message::TokenUsage;
use crate::schema::CompiledSchema;

const USAGE_FIELDS: [&str; 3] = ["total_tokens", "input_tokens", "output_tokens"];

#[derive(Clone, Debug)]
pub struct OutputCoercer {
    schema: CompiledSchema,
}

impl OutputCoercer {
    pub fn new(schema: Value) -> Result<Self, SchemaError> {
        Ok(Self {
            schema: CompiledSchema::compile(schema)?,
        })
    }

    pub fn schema(&self) -> &Value {
        self.schema.raw()
    }

    /// Returns the coerced value, or the reasons every recovery step failed.
    pub fn coerce(&self, content: &str, usage: &TokenUsage) -> Result<Value, String> {
        let mut failures = Vec::new();

        match serde_json::from_str::<Value>(strip_fence(content)) {
            Ok(value) => match self.accept(value, usage) {
                Ok(value) => return Ok(value),
                Err(reason) => failures.push(format!("parsed JSON rejected: {reason}")),
            },
            Err(err) => failures.push(format!("not JSON: {err}")),
        }

        if let Some((_, _, value)) = first_json_object(content) {
            match self.accept(value, usage) {
                Ok(value) => {
                    debug!("output coerced from embedded JSON object");
                    return Ok(value);
                }
                Err(reason) => failures.push(format!("embedded JSON rejected: {reason}")),
            }
        }

        if let Some(envelope) = self.envelope(content) {
            match self.accept(envelope, usage) {
                Ok(value) => {
                    debug!("output coerced by wrapping raw text");
                    return Ok(value);
                }
                Err(reason) => failures.push(format!("wrapped text rejected: {reason}")),
            }
        }

        Err(failures.join("; "))
    }

    fn accept(&self, mut value: Value, usage: &TokenUsage) -> Result<Value, String> {
        self.fill_usage(&mut value, usage);
        self.schema.validate(&value)?;
        Ok(value)
    }

    fn fill_usage(&self, value: &mut Value, usage: &TokenUsage) {
        let (Some(object), Some(properties)) = (value.as_object_mut(), self.properties()) else {
            return;
        };

        for field in USAGE_FIELDS {
            let declared_numeric = properties
                .get(field)
                .and_then(|property| property.get("type"))
                .and_then(Value::as_str)
                .is_some_and(|kind| kind == "integer" || kind == "number");
            if !declared_numeric || object.contains_key(field) {
                continue;
            }

            let count = match field {
                "input_tokens" => usage.input_tokens,
                "output_tokens" => usage.output_tokens,
                _ => usage.total_tokens(),
            };
            object.insert(field.to_string(), Value::from(count));
        }
    }

    fn envelope(&self, content: &str) -> Option<Value> {
        let schema = self.schema.raw();
        if schema.get("type").and_then(Value::as_str) == Some("string") {
            return Some(Value::String(content.to_string()));
        }

        let field = self.text_field()?;
        let mut object = Map::new();
        object.insert(field, Value::String(content.trim().to_string()));
        Some(Value::Object(object))
    }

    /// First required string property, else the first string property.
    fn text_field(&self) -> Option<String> {
        let properties = self.properties()?;
        let is_text = |name: &str| {
            properties
                .get(name)
                .and_then(|property| property.get("type"))
                .and_then(Value::as_str)
                == Some("string")
        };

        let required = self
            .schema
            .raw()
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);

        for name in required {
            if is_text(name) {
                return Some(name.to_string());
            }
        }

        properties
            .keys()
            .find(|name| is_text(name.as_str()))
            .cloned()
    }

    fn properties(&self) -> Option<&Map<String, Value>> {
        self.schema.raw().get("properties").and_then(Value::as_object)
    }
}

fn strip_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = body.trim_start_matches(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    body.strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn simple_response() -> OutputCoercer {
        OutputCoercer::new(json!({
            "type": "object",
            "properties": {
                "message": {"type": "string"},
                "total_tokens": {"type": "integer"}
            },
            "required": ["message", "total_tokens"]
        }))
        .expect("schema compiles")
    }

    fn usage() -> TokenUsage {
        TokenUsage {
            input_tokens: 30,
            output_tokens: 12,
        }
    }

    #[test]
    fn strict_json_is_validated_and_usage_filled() {
        let value = simple_response()
            .coerce(r#"{"message": "425"}"#, &usage())
            .expect("coerces");
        assert_eq!(value, json!({"message": "425", "total_tokens": 42}));
    }

    #[test]
    fn explicit_usage_values_are_kept() {
        let value = simple_response()
            .coerce(r#"{"message": "425", "total_tokens": 7}"#, &usage())
            .expect("coerces");
        assert_eq!(value["total_tokens"], 7);
    }

    #[test]
    fn fenced_json_is_accepted() {
        let value = simple_response()
            .coerce("```json\n{\"message\": \"ok\"}\n```", &usage())
            .expect("coerces");
        assert_eq!(value["message"], "ok");
    }

    #[test]
    fn embedded_object_is_recovered() {
        let value = simple_response()
            .coerce("Here you go: {\"message\": \"85\"} hope that helps", &usage())
            .expect("coerces");
        assert_eq!(value["message"], "85");
    }

    #[test]
    fn plain_text_is_wrapped_into_text_field() {
        let value = simple_response()
            .coerce("15 * 23 = 345", &usage())
            .expect("coerces");
        assert_eq!(value, json!({"message": "15 * 23 = 345", "total_tokens": 42}));
    }

    #[test]
    fn string_schema_takes_raw_text() {
        let coercer = OutputCoercer::new(json!({"type": "string"})).expect("schema compiles");
        let value = coercer.coerce("just words", &usage()).expect("coerces");
        assert_eq!(value, json!("just words"));
    }

    #[test]
    fn unsatisfiable_schema_reports_every_step() {
        let coercer = OutputCoercer::new(json!({
            "type": "object",
            "properties": {"value": {"type": "number"}},
            "required": ["value"]
        }))
        .expect("schema compiles");

        let reason = coercer.coerce("no numbers here", &usage()).expect_err("fails");
        assert!(reason.contains("not JSON"));
        assert!(!reason.contains("wrapped text"));
    }
}
