//! JSON Schema handling for tool arguments and structured run output.

use std::sync::Arc;

use jsonschema::Validator;
use serde_json::Value;

use crate::error::SchemaError;

/// A JSON Schema together with its compiled validator.
#[derive(Clone)]
pub struct CompiledSchema {
    raw: Value,
    validator: Arc<Validator>,
}

impl std::fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("raw", &self.raw)
            .finish()
    }
}

impl CompiledSchema {
    pub fn compile(schema: Value) -> Result<Self, SchemaError> {
        let validator =
            jsonschema::validator_for(&schema).map_err(|err| SchemaError::Invalid(err.to_string()))?;
        Ok(Self {
            raw: schema,
            validator: Arc::new(validator),
        })
    }

    /// Compiles a tool argument schema, which must describe a JSON object.
    pub fn compile_tool_schema(schema: Value) -> Result<Self, SchemaError> {
        check_tool_schema(&schema)?;
        Self::compile(schema)
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    #[cfg(test)]
    pub(crate) fn shares_validator_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.validator, &other.validator)
    }

    /// Returns `Ok(())` or a `; `-joined description of every violation.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let errors = self
            .validator
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

fn check_tool_schema(schema: &Value) -> Result<(), SchemaError> {
    let schema_obj = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

    let root_type = schema_obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(SchemaError::RootTypeMustBeObject)?;

    if root_type != "object" {
        return Err(SchemaError::RootTypeMustBeObject);
    }

    if let Some(required) = schema_obj.get("required") {
        let required_arr = required.as_array().ok_or(SchemaError::InvalidRequired)?;
        if required_arr.iter().any(|item| !item.is_string()) {
            return Err(SchemaError::InvalidRequired);
        }
    }

    Ok(())
}

/// Schema accepted by tools that do not declare one.
pub(crate) fn permissive_object_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": [],
        "additionalProperties": true,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn tool_schema_rejects_non_object_root() {
        let result = CompiledSchema::compile_tool_schema(json!({"type": "string"}));
        assert!(matches!(result, Err(SchemaError::RootTypeMustBeObject)));
    }

    #[test]
    fn tool_schema_rejects_non_string_required() {
        let result = CompiledSchema::compile_tool_schema(json!({
            "type": "object",
            "required": [1]
        }));
        assert!(matches!(result, Err(SchemaError::InvalidRequired)));
    }

    #[test]
    fn validate_reports_missing_required_field() {
        let schema = CompiledSchema::compile_tool_schema(json!({
            "type": "object",
            "properties": {"expression": {"type": "string"}},
            "required": ["expression"]
        }))
        .expect("schema compiles");

        assert!(schema.validate(&json!({"expression": "2+2"})).is_ok());

        let message = schema.validate(&json!({})).expect_err("must fail");
        assert!(message.contains("expression"));
    }

    #[test]
    fn validate_checks_nested_types() {
        let schema = CompiledSchema::compile(json!({
            "type": "object",
            "properties": {
                "items": {"type": "array", "items": {"type": "integer"}}
            }
        }))
        .expect("schema compiles");

        assert!(schema.validate(&json!({"items": [1, 2]})).is_ok());
        assert!(schema.validate(&json!({"items": [1, "two"]})).is_err());
    }
}
