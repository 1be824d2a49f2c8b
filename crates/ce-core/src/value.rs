// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runtime-defined field types and scalar output coercion.
//!
//! Contract field types arrive as strings at load time, not as compile-time
//! types. They are parsed once into [`FieldType`] and every later decision
//! (defaulting, media resolution, output coercion) dispatches on that tag.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// ScalarType
// ---------------------------------------------------------------------------

/// The six scalar contract type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ScalarType {
    /// Canonical lowercase tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "string" => Some(Self::String),
            "integer" => Some(Self::Integer),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// FieldType
// ---------------------------------------------------------------------------

/// A contract field type: either a scalar tag or a media MIME tag of the
/// form `{image|video|audio|file}/<subtype>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Scalar(ScalarType),
    Media(String),
}

/// Top-level media families accepted in media tags.
const MEDIA_FAMILIES: &[&str] = &["image", "video", "audio", "file"];

fn is_valid_media_subtype(subtype: &str) -> bool {
    let mut chars = subtype.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'))
}

impl FieldType {
    /// Returns `true` for media-tagged fields.
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Media(_))
    }

    /// The scalar tag, if this is a scalar field.
    pub fn as_scalar(&self) -> Option<ScalarType> {
        match self {
            Self::Scalar(s) => Some(*s),
            Self::Media(_) => None,
        }
    }

    /// The type-default value used by preflight payloads.
    ///
    /// Media fields default to `""` like strings: the preflight submission
    /// only needs a syntactically valid slot value.
    pub fn default_value(&self) -> Value {
        match self {
            Self::Scalar(ScalarType::String) | Self::Media(_) => Value::String(String::new()),
            Self::Scalar(ScalarType::Integer) => Value::from(0),
            Self::Scalar(ScalarType::Number) => Value::from(0.0),
            Self::Scalar(ScalarType::Boolean) => Value::Bool(false),
            Self::Scalar(ScalarType::Object) => Value::Object(serde_json::Map::new()),
            Self::Scalar(ScalarType::Array) => Value::Array(Vec::new()),
        }
    }

    /// Canonical lowercase form.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Scalar(s) => s.as_str(),
            Self::Media(m) => m.as_str(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a type tag is neither a scalar nor a media tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported contract field type: {0}")]
pub struct UnsupportedFieldType(pub String);

impl FromStr for FieldType {
    type Err = UnsupportedFieldType;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        if let Some(scalar) = ScalarType::parse(&normalized) {
            return Ok(Self::Scalar(scalar));
        }
        if let Some((family, subtype)) = normalized.split_once('/') {
            if MEDIA_FAMILIES.contains(&family) && is_valid_media_subtype(subtype) {
                return Ok(Self::Media(normalized));
            }
        }
        Err(UnsupportedFieldType(raw.to_string()))
    }
}

impl Serialize for FieldType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Output coercion
// ---------------------------------------------------------------------------

/// Failure to coerce a raw artifact value to the declared scalar type.
///
/// The detail string is part of the wire contract: it becomes the suffix of
/// an `OUTPUT_TYPE_ERROR:<detail>` job error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{detail}")]
pub struct CoercionError {
    pub detail: String,
}

impl CoercionError {
    fn cannot(target: ScalarType) -> Self {
        Self {
            detail: format!("cannot_coerce_to_{target}"),
        }
    }
}

/// Coerce a raw artifact value to the declared scalar output type.
///
/// Rules:
/// - `string`: identity on strings; decimal/literal conversion of numbers
///   and booleans; everything else fails.
/// - `integer`: booleans rejected; integral floats truncate; decimal strings
///   parse.
/// - `number`: booleans rejected; numeric strings parse.
/// - `boolean`: native bools; the string forms `1/true/yes/on` and
///   `0/false/no/off` (case-insensitive).
/// - `object` / `array`: the value must already be a mapping / sequence.
pub fn coerce_scalar_output(target: ScalarType, raw: &Value) -> Result<Value, CoercionError> {
    match target {
        ScalarType::String => match raw {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(CoercionError::cannot(ScalarType::String)),
        },
        ScalarType::Integer => match raw {
            Value::Bool(_) => Err(CoercionError::cannot(ScalarType::Integer)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::from(i))
                } else if let Some(f) = n.as_f64() {
                    // Truncation toward zero, the way the engine-side nodes
                    // round their numeric widget values.
                    if f.is_finite() {
                        Ok(Value::from(f.trunc() as i64))
                    } else {
                        Err(CoercionError::cannot(ScalarType::Integer))
                    }
                } else {
                    Err(CoercionError::cannot(ScalarType::Integer))
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| CoercionError::cannot(ScalarType::Integer)),
            _ => Err(CoercionError::cannot(ScalarType::Integer)),
        },
        ScalarType::Number => match raw {
            Value::Bool(_) => Err(CoercionError::cannot(ScalarType::Number)),
            Value::Number(n) => n
                .as_f64()
                .map(Value::from)
                .ok_or_else(|| CoercionError::cannot(ScalarType::Number)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::from)
                .ok_or_else(|| CoercionError::cannot(ScalarType::Number)),
            _ => Err(CoercionError::cannot(ScalarType::Number)),
        },
        ScalarType::Boolean => match raw {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Value::Bool(true)),
                "0" | "false" | "no" | "off" => Ok(Value::Bool(false)),
                _ => Err(CoercionError::cannot(ScalarType::Boolean)),
            },
            _ => Err(CoercionError::cannot(ScalarType::Boolean)),
        },
        ScalarType::Object => match raw {
            Value::Object(_) => Ok(raw.clone()),
            _ => Err(CoercionError::cannot(ScalarType::Object)),
        },
        ScalarType::Array => match raw {
            Value::Array(_) => Ok(raw.clone()),
            _ => Err(CoercionError::cannot(ScalarType::Array)),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
