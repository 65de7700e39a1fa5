//! Structural validation of tool arguments against a JSON Schema subset.
//!
//! Servers describe tool inputs with JSON Schema. We honor the subset that
//! appears in practice: primitive types, objects with `properties` and
//! `required`, and arrays with `items`. Anything we do not understand
//! degrades to accept-all rather than rejecting calls a server would take.

use serde_json::Value;

/// Parsed schema tree for one tool's `inputSchema`.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    String,
    Number,
    Integer,
    Boolean,
    Null,
    Object {
        properties: Vec<(String, SchemaNode)>,
        required: Vec<String>,
    },
    Array {
        items: Box<SchemaNode>,
    },
    /// Unconstrained or unrecognized schema. Accepts any value.
    Any,
}

impl SchemaNode {
    /// Parse a JSON Schema value into the supported subset.
    pub fn parse(schema: &Value) -> Self {
        let Some(obj) = schema.as_object() else {
            return SchemaNode::Any;
        };
        match obj.get("type").and_then(Value::as_str) {
            Some("string") => SchemaNode::String,
            Some("number") => SchemaNode::Number,
            Some("integer") => SchemaNode::Integer,
            Some("boolean") => SchemaNode::Boolean,
            Some("null") => SchemaNode::Null,
            Some("array") => SchemaNode::Array {
                items: Box::new(
                    obj.get("items").map(SchemaNode::parse).unwrap_or(SchemaNode::Any),
                ),
            },
            Some("object") => {
                let properties = obj
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|props| {
                        props
                            .iter()
                            .map(|(name, sub)| (name.clone(), SchemaNode::parse(sub)))
                            .collect()
                    })
                    .unwrap_or_default();
                let required = obj
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                SchemaNode::Object { properties, required }
            }
            _ => SchemaNode::Any,
        }
    }

    /// Check `value` against this schema. Returns the first violation found,
    /// phrased with a JSON-pointer-ish path for the offending field.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        self.validate_at(value, "")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<(), String> {
        let here = if path.is_empty() { "arguments" } else { path };
        match self {
            SchemaNode::Any => Ok(()),
            SchemaNode::String => match value {
                Value::String(_) => Ok(()),
                other => Err(format!("{here}: expected string, got {}", kind(other))),
            },
            SchemaNode::Number => match value {
                Value::Number(_) => Ok(()),
                other => Err(format!("{here}: expected number, got {}", kind(other))),
            },
            SchemaNode::Integer => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(()),
                other => Err(format!("{here}: expected integer, got {}", kind(other))),
            },
            SchemaNode::Boolean => match value {
                Value::Bool(_) => Ok(()),
                other => Err(format!("{here}: expected boolean, got {}", kind(other))),
            },
            SchemaNode::Null => match value {
                Value::Null => Ok(()),
                other => Err(format!("{here}: expected null, got {}", kind(other))),
            },
            SchemaNode::Array { items } => match value {
                Value::Array(elements) => {
                    for (idx, element) in elements.iter().enumerate() {
                        items.validate_at(element, &format!("{here}[{idx}]"))?;
                    }
                    Ok(())
                }
                other => Err(format!("{here}: expected array, got {}", kind(other))),
            },
            SchemaNode::Object { properties, required } => {
                let Value::Object(fields) = value else {
                    return Err(format!("{here}: expected object, got {}", kind(value)));
                };
                for name in required {
                    if !fields.contains_key(name) {
                        return Err(format!("{here}: missing required field '{name}'"));
                    }
                }
                for (name, schema) in properties {
                    if let Some(field) = fields.get(name) {
                        schema.validate_at(field, &format!("{here}.{name}"))?;
                    }
                }
                // Fields the schema does not mention pass through untouched.
                Ok(())
            }
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
