//! Output shapes requested from the oracle and decoding of structured replies.

use jsonschema::Draft;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::transcript::ToolCall;
use crate::error::OracleError;

/// A capability the oracle may call, described as a JSON schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the call arguments.
    pub parameters: Value,
}

/// A named JSON schema a structured reply must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuredSchema {
    pub name: &'static str,
    pub schema: &'static str,
}

impl StructuredSchema {
    pub const PLAN_UPDATE: StructuredSchema = StructuredSchema {
        name: "plan_update",
        schema: include_str!("../../schemas/plan_update.schema.json"),
    };
    pub const PLAN_SELECTION: StructuredSchema = StructuredSchema {
        name: "plan_selection",
        schema: include_str!("../../schemas/plan_selection.schema.json"),
    };
    pub const EXECUTION_ANALYSIS: StructuredSchema = StructuredSchema {
        name: "execution_analysis",
        schema: include_str!("../../schemas/execution_analysis.schema.json"),
    };
    pub const KNOWLEDGE_MERGE: StructuredSchema = StructuredSchema {
        name: "knowledge_merge",
        schema: include_str!("../../schemas/knowledge_merge.schema.json"),
    };

    /// Parsed schema document.
    pub fn to_value(&self) -> Result<Value, OracleError> {
        serde_json::from_str(self.schema).map_err(|err| OracleError::Schema {
            shape: self.name.to_string(),
            message: format!("schema is not valid JSON: {err}"),
        })
    }

    /// Validate `value` against the schema, then deserialize it.
    pub fn decode<T: DeserializeOwned>(&self, value: &Value) -> Result<T, OracleError> {
        let schema = self.to_value()?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .map_err(|err| self.schema_error(format!("compile schema: {err}")))?;
        let violations: Vec<String> = validator
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect();
        if !violations.is_empty() {
            return Err(self.schema_error(violations.join("; ")));
        }
        serde_json::from_value(value.clone()).map_err(|err| self.schema_error(err.to_string()))
    }

    fn schema_error(&self, message: String) -> OracleError {
        OracleError::Schema {
            shape: self.name.to_string(),
            message,
        }
    }
}

/// Shape a single oracle invocation must return.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputShape {
    /// Free text.
    Text,
    /// Free text and/or calls to any of the listed tools.
    Tools(Vec<ToolSpec>),
    /// A JSON value conforming to the schema.
    Structured(StructuredSchema),
}

impl OutputShape {
    pub fn label(&self) -> &'static str {
        match self {
            OutputShape::Text => "text",
            OutputShape::Tools(_) => "tools",
            OutputShape::Structured(schema) => schema.name,
        }
    }
}

/// Oracle reply parsed according to the requested shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParsedValue {
    Text(String),
    /// Text alongside zero or more tool calls; `calls` empty means a final answer.
    ToolCalls { text: String, calls: Vec<ToolCall> },
    Structured(Value),
}

impl ParsedValue {
    /// Decode a structured reply, rejecting any other variant.
    pub fn decode<T: DeserializeOwned>(&self, schema: &StructuredSchema) -> Result<T, OracleError> {
        match self {
            ParsedValue::Structured(value) => schema.decode(value),
            other => Err(OracleError::Schema {
                shape: schema.name.to_string(),
                message: format!("expected structured reply, got {}", other.kind()),
            }),
        }
    }

    /// Text content; tool calls and structured values yield their text or JSON.
    pub fn into_text(self) -> String {
        match self {
            ParsedValue::Text(text) | ParsedValue::ToolCalls { text, .. } => text,
            ParsedValue::Structured(value) => value.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ParsedValue::Text(_) => "text",
            ParsedValue::ToolCalls { .. } => "tool calls",
            ParsedValue::Structured(_) => "structured",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AnalyzedExecution, PlanResult};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Selection {
        result: PlanResult,
    }

    #[test]
    fn bundled_schemas_parse() {
        for schema in [
            StructuredSchema::PLAN_UPDATE,
            StructuredSchema::PLAN_SELECTION,
            StructuredSchema::EXECUTION_ANALYSIS,
            StructuredSchema::KNOWLEDGE_MERGE,
        ] {
            let value = schema.to_value().expect("schema json");
            assert_eq!(value["type"], "object", "{}", schema.name);
        }
    }

    #[test]
    fn selection_accepts_exactly_one_variant() {
        let finished = json!({"result": {"action": "finished", "response": "got DA"}});
        let parsed: Selection = StructuredSchema::PLAN_SELECTION
            .decode(&finished)
            .expect("finished");
        assert!(matches!(parsed.result, PlanResult::Finished { .. }));

        let both = json!({"result": {
            "action": "task",
            "next_step": "scan",
            "next_step_context": "",
            "tags": [],
            "response": "also done"
        }});
        let err = StructuredSchema::PLAN_SELECTION
            .decode::<Selection>(&both)
            .expect_err("both variants");
        assert!(matches!(err, OracleError::Schema { .. }));
    }

    #[test]
    fn analysis_requires_all_lists() {
        let err = StructuredSchema::EXECUTION_ANALYSIS
            .decode::<AnalyzedExecution>(&json!({"gathered_knowledge": []}))
            .expect_err("missing fields");
        let OracleError::Schema { shape, message } = err else {
            panic!("expected schema error");
        };
        assert_eq!(shape, "execution_analysis");
        assert!(message.contains("vulnerabilities"), "{message}");
    }

    #[test]
    fn text_reply_is_not_structured() {
        let err = ParsedValue::Text("hello".to_string())
            .decode::<AnalyzedExecution>(&StructuredSchema::EXECUTION_ANALYSIS)
            .expect_err("text");
        assert!(err.to_string().contains("expected structured reply"));
    }
}
