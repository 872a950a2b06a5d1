//! Declarative description of the `predict` inputs.
//!
//! [`PREDICT_INPUTS`] is the single source of truth: validation, defaults and
//! the published JSON schema are all derived from it.

use serde_json::{json, Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
}

impl FieldKind {
    fn json_type(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constraint {
    Any,
    /// Inclusive bounds.
    Range { ge: f64, le: f64 },
    Choices(&'static [i64]),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Str(&'static str),
    Int(i64),
    Float(f64),
    /// The field is optional and stays unset.
    Unset,
}

impl DefaultValue {
    fn to_value(self) -> Value {
        match self {
            DefaultValue::Str(s) => Value::from(s),
            DefaultValue::Int(i) => Value::from(i),
            DefaultValue::Float(f) => Value::from(f),
            DefaultValue::Unset => Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputField {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: FieldKind,
    pub default: DefaultValue,
    pub constraint: Constraint,
}

pub const PREDICT_INPUTS: &[InputField] = &[
    InputField {
        name: "prompt",
        description: "Input prompt",
        kind: FieldKind::String,
        default: DefaultValue::Str(""),
        constraint: Constraint::Any,
    },
    InputField {
        name: "num_outputs",
        description: "Number of images to output",
        kind: FieldKind::Integer,
        default: DefaultValue::Int(1),
        constraint: Constraint::Choices(&[1, 2, 3, 4]),
    },
    InputField {
        name: "num_inference_steps",
        description: "Number of denoising steps",
        kind: FieldKind::Integer,
        default: DefaultValue::Int(25),
        constraint: Constraint::Range { ge: 1.0, le: 50.0 },
    },
    InputField {
        name: "guidance_scale",
        description: "Scale for classifier-free guidance",
        kind: FieldKind::Number,
        default: DefaultValue::Float(7.5),
        constraint: Constraint::Range { ge: 1.0, le: 20.0 },
    },
    InputField {
        name: "seed",
        description: "Random seed. Leave blank to randomize the seed",
        kind: FieldKind::Integer,
        default: DefaultValue::Unset,
        constraint: Constraint::Any,
    },
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("input must be a JSON object")]
    NotAnObject,
    #[error("{field}: unexpected input field")]
    UnknownField { field: String },
    #[error("{field}: expected {expected}, got {found}")]
    InvalidType {
        field: &'static str,
        expected: &'static str,
        found: String,
    },
    #[error("{field}: {value} is not one of {choices:?}")]
    NotAChoice {
        field: &'static str,
        value: String,
        choices: &'static [i64],
    },
    #[error("{field}: {value} must be between {ge} and {le}")]
    OutOfRange {
        field: &'static str,
        value: String,
        ge: f64,
        le: f64,
    },
}

impl ValidationError {
    /// Name of the offending field, if the error is about a single field.
    pub fn field(&self) -> Option<&str> {
        match self {
            ValidationError::NotAnObject => None,
            ValidationError::UnknownField { field } => Some(field),
            ValidationError::InvalidType { field, .. }
            | ValidationError::NotAChoice { field, .. }
            | ValidationError::OutOfRange { field, .. } => Some(field),
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(n) => format!("number {n}"),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

/// Integral JSON numbers, including floats such as `2.0`.
fn as_integer(number: &Number) -> Option<Value> {
    if number.is_i64() || number.is_u64() {
        return Some(Value::Number(number.clone()));
    }
    let f = number.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(Value::from(f as i64))
    } else {
        None
    }
}

impl InputField {
    /// Applies the default, type and constraint to one raw input value.
    pub fn resolve(&self, raw: Option<&Value>) -> Result<Value, ValidationError> {
        let raw = match raw {
            None | Some(Value::Null) => return Ok(self.default.to_value()),
            Some(raw) => raw,
        };
        let invalid_type = || ValidationError::InvalidType {
            field: self.name,
            expected: self.kind.json_type(),
            found: describe(raw),
        };
        let value = match (self.kind, raw) {
            (FieldKind::String, Value::String(_)) => raw.clone(),
            (FieldKind::Integer, Value::Number(n)) => as_integer(n).ok_or_else(invalid_type)?,
            (FieldKind::Number, Value::Number(_)) => raw.clone(),
            _ => return Err(invalid_type()),
        };
        self.check(&value)?;
        Ok(value)
    }

    fn check(&self, value: &Value) -> Result<(), ValidationError> {
        match self.constraint {
            Constraint::Any => Ok(()),
            Constraint::Range { ge, le } => {
                let x = value.as_f64().unwrap_or(f64::NAN);
                if x >= ge && x <= le {
                    Ok(())
                } else {
                    Err(ValidationError::OutOfRange {
                        field: self.name,
                        value: value.to_string(),
                        ge,
                        le,
                    })
                }
            }
            Constraint::Choices(choices) => match value.as_i64() {
                Some(x) if choices.contains(&x) => Ok(()),
                _ => Err(ValidationError::NotAChoice {
                    field: self.name,
                    value: value.to_string(),
                    choices,
                }),
            },
        }
    }

    fn title(&self) -> String {
        self.name
            .split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join(" ")
    }

    fn json_schema(&self, order: usize) -> Value {
        let mut schema = Map::new();
        schema.insert("type".to_string(), json!(self.kind.json_type()));
        schema.insert("title".to_string(), json!(self.title()));
        schema.insert("description".to_string(), json!(self.description));
        schema.insert("x-order".to_string(), json!(order));
        if self.default != DefaultValue::Unset {
            schema.insert("default".to_string(), self.default.to_value());
        }
        match self.constraint {
            Constraint::Any => {}
            Constraint::Range { ge, le } => {
                let (min, max) = match self.kind {
                    FieldKind::Integer => (json!(ge as i64), json!(le as i64)),
                    _ => (json!(ge), json!(le)),
                };
                schema.insert("minimum".to_string(), min);
                schema.insert("maximum".to_string(), max);
            }
            Constraint::Choices(choices) => {
                schema.insert("enum".to_string(), json!(choices));
            }
        }
        Value::Object(schema)
    }
}

/// Validates a raw input object against `fields`, returning every field
/// resolved to a concrete value (defaults filled in).
pub fn validate(
    fields: &[InputField],
    input: &Map<String, Value>,
) -> Result<Map<String, Value>, ValidationError> {
    if let Some(unknown) = input.keys().find(|k| !fields.iter().any(|f| f.name == k.as_str())) {
        return Err(ValidationError::UnknownField {
            field: unknown.clone(),
        });
    }
    fields
        .iter()
        .map(|field| Ok((field.name.to_string(), field.resolve(input.get(field.name))?)))
        .collect()
}

/// JSON schema of the input object, in the shape Cog publishes as `Input`.
pub fn input_schema(fields: &[InputField]) -> Value {
    let properties: Map<String, Value> = fields
        .iter()
        .enumerate()
        .map(|(order, field)| (field.name.to_string(), field.json_schema(order)))
        .collect();
    json!({
        "type": "object",
        "title": "Input",
        "properties": properties,
    })
}
