//! OutputSchemaValidator: per-route JSON shape check (§4.9).
//!
//! Grounded on the teacher's `signature::types::FieldType::to_json_schema`
//! and `signature::validation::validate_value` — plain `serde_json::Value`
//! schema fragments, validated field by field, no external schema-validation
//! crate.

use serde_json::{json, Value};

/// A field's expected shape, mirroring the teacher's `FieldType` but scoped
/// to what route-output validation needs.
#[derive(Debug, Clone)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    List(Box<FieldType>),
    Object(Vec<FieldSpec>),
}

impl FieldType {
    pub fn to_json_schema(&self) -> Value {
        match self {
            FieldType::String => json!({"type": "string"}),
            FieldType::Integer => json!({"type": "integer"}),
            FieldType::Float => json!({"type": "number"}),
            FieldType::Boolean => json!({"type": "boolean"}),
            FieldType::List(inner) => json!({"type": "array", "items": inner.to_json_schema()}),
            FieldType::Object(fields) => {
                let mut properties = serde_json::Map::new();
                let mut required = Vec::new();
                for field in fields {
                    properties.insert(field.name.clone(), field.field_type.to_json_schema());
                    if field.required {
                        required.push(Value::String(field.name.clone()));
                    }
                }
                json!({
                    "type": "object",
                    "properties": Value::Object(properties),
                    "required": required,
                })
            }
        }
    }

    fn is_compatible(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldType::Float, Value::Number(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::List(inner), Value::Array(items)) => {
                items.iter().all(|item| inner.is_compatible(item))
            }
            (FieldType::Object(fields), Value::Object(map)) => fields.iter().all(|f| {
                match map.get(&f.name) {
                    Some(v) => f.field_type.is_compatible(v),
                    None => !f.required,
                }
            }),
            _ => false,
        }
    }
}

/// One field of a route's output object.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            required,
        }
    }
}

/// A route's minimal output schema, e.g. `{"answer": string}`.
#[derive(Debug, Clone)]
pub struct RouteSchema {
    pub fields: Vec<FieldSpec>,
}

impl RouteSchema {
    /// The minimal schema used by plain-text routes: a single required
    /// `answer` string field (§4.9: "plain-text answers are auto-wrapped into
    /// the route's minimal object before validation").
    pub fn answer_only() -> Self {
        Self {
            fields: vec![FieldSpec::new("answer", FieldType::String, true)],
        }
    }

    pub fn to_json_schema(&self) -> Value {
        FieldType::Object(self.fields.clone()).to_json_schema()
    }

    fn validate_value(&self, value: &Value) -> bool {
        FieldType::Object(self.fields.clone()).is_compatible(value)
    }
}

/// Wrap a plain-text answer into the route's minimal object, per §4.9.
pub fn wrap_plain_text_answer(answer: &str) -> Value {
    json!({ "answer": answer })
}

/// `validate(answer_or_structured, route_schema) -> bool`. Structure only;
/// never enforces content safety (§4.9). Invalid input does not block: the
/// orchestrator sets `metadata.schema_valid=false` and keeps the answer.
pub fn validate(value: &Value, schema: &RouteSchema) -> bool {
    schema.validate_value(value)
}
