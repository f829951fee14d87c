use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Port type identifier for connection validation.
///
/// `Json` and `Object` are equivalent at runtime; `Any` disables type
/// checking on that port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Json,
    Any,
}

impl PortType {
    /// Whether a connection from an output of type `source` may feed an
    /// input of this type. Either side being `any` is always admissible,
    /// equal types are admissible, and a `string` output may feed a
    /// `json`/`object` input (the value is parsed on read).
    pub fn accepts_from(&self, source: PortType) -> bool {
        if matches!(self, PortType::Any) || matches!(source, PortType::Any) {
            return true;
        }

        if self.is_object_like() && source.is_object_like() {
            return true;
        }

        if self.is_object_like() && source == PortType::String {
            return true;
        }

        *self == source
    }

    pub fn is_object_like(&self) -> bool {
        matches!(self, PortType::Object | PortType::Json)
    }

    /// Whether a concrete value already conforms to this port type. `null`
    /// conforms everywhere: it is the runtime representation of an absent
    /// optional value.
    pub fn value_conforms(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }

        match self {
            PortType::Any => true,
            PortType::String => value.is_string(),
            PortType::Number => value.is_number(),
            PortType::Boolean => value.is_boolean(),
            PortType::Array => value.is_array(),
            PortType::Object | PortType::Json => value.is_object(),
        }
    }
}

/// A human-readable tag for a JSON value's kind, used in error messages.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Emptiness as observed by Merge and PassThrough: null, empty arrays,
/// empty objects, and whitespace-only strings are empty. Zero, `false`,
/// and `0.0` are NOT empty.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
