use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema tag for one field of a mapping key or value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int,
    Str,
}

/// One typed field of a mapping key or value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Str(String),
}

/// Ordered list of fields. Used for both (possibly composite) source keys
/// and target values of a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tuple(Vec<FieldValue>);

/// Declared field: column name in segment headers plus its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
}

impl Field {
    pub const fn int(name: &'static str) -> Self {
        Self {
            name,
            ty: FieldType::Int,
        }
    }

    pub const fn string(name: &'static str) -> Self {
        Self {
            name,
            ty: FieldType::Str,
        }
    }
}

impl FieldType {
    /// Decode a raw segment cell.
    pub fn parse(self, raw: &str) -> Result<FieldValue, String> {
        match self {
            Self::Int => raw
                .trim()
                .parse::<i64>()
                .map(FieldValue::Int)
                .map_err(|_| format!("expected integer, found '{raw}'")),
            Self::Str => Ok(FieldValue::Str(raw.to_string())),
        }
    }

    pub fn accepts(self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (Self::Int, FieldValue::Int(_)) | (Self::Str, FieldValue::Str(_))
        )
    }

    /// Coerce an id as returned by the remote API into this field type.
    /// Numbers and numeric strings are accepted for `Int`; `Str` accepts
    /// strings and stringifies numbers.
    pub fn from_json(self, value: &Value) -> Option<FieldValue> {
        match (self, value) {
            (Self::Int, Value::Number(n)) => n.as_i64().map(FieldValue::Int),
            (Self::Int, Value::String(s)) => s.trim().parse().ok().map(FieldValue::Int),
            (Self::Str, Value::String(s)) => Some(FieldValue::Str(s.clone())),
            (Self::Str, Value::Number(n)) => Some(FieldValue::Str(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Str => write!(f, "string"),
        }
    }
}

impl FieldValue {
    pub fn encode(&self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Str(s) => s.clone(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(n) => Value::from(*n),
            Self::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for FieldValue {
    fn from(n: i32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl Tuple {
    pub fn new(fields: Vec<FieldValue>) -> Self {
        Self(fields)
    }

    pub fn single(value: impl Into<FieldValue>) -> Self {
        Self(vec![value.into()])
    }

    pub fn fields(&self) -> &[FieldValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The sole field of a single-field tuple.
    pub fn as_single(&self) -> Option<&FieldValue> {
        match self.0.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// True when arity and every field type match `schema`.
    pub fn conforms_to(&self, schema: &[Field]) -> bool {
        self.0.len() == schema.len()
            && self
                .0
                .iter()
                .zip(schema)
                .all(|(value, field)| field.ty.accepts(value))
    }

    pub fn encode(&self) -> Vec<String> {
        self.0.iter().map(FieldValue::encode).collect()
    }

    /// Decode cells positionally against `schema`.
    pub fn decode(cells: &[&str], schema: &[Field]) -> Result<Self, String> {
        if cells.len() != schema.len() {
            return Err(format!(
                "expected {} fields, found {}",
                schema.len(),
                cells.len()
            ));
        }
        cells
            .iter()
            .zip(schema)
            .map(|(cell, field)| {
                field
                    .ty
                    .parse(cell)
                    .map_err(|e| format!("field '{}': {e}", field.name))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

/// Composite tuples render as their fields joined with `-`, which is also the
/// prefix used when renaming a conflicting entity.
impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join("-"))
    }
}

impl From<FieldValue> for Tuple {
    fn from(value: FieldValue) -> Self {
        Self(vec![value])
    }
}

impl<A: Into<FieldValue>, B: Into<FieldValue>> From<(A, B)> for Tuple {
    fn from((a, b): (A, B)) -> Self {
        Self(vec![a.into(), b.into()])
    }
}

pub fn describe(schema: &[Field]) -> String {
    schema
        .iter()
        .map(|f| format!("{}:{}", f.name, f.ty))
        .collect::<Vec<_>>()
        .join(", ")
}
