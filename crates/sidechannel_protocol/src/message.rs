use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

// -----------------------------------------------------------------------------
// Parameter values
// -----------------------------------------------------------------------------

/// One positional parameter of a [`Message`], or the value of a query result.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ParamValue::Null => "null",
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Text(_) => "text",
            ParamValue::Bytes(_) => "bytes",
            ParamValue::List(_) => "list",
            ParamValue::Map(_) => "map",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Ints widen to floats, nothing else converts.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(f) => Some(*f),
            ParamValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ParamValue>> {
        match self {
            ParamValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

// Floats compare by bit pattern so that `Message` can be a lawful map key.
impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParamValue::Null, ParamValue::Null) => true,
            (ParamValue::Bool(a), ParamValue::Bool(b)) => a == b,
            (ParamValue::Int(a), ParamValue::Int(b)) => a == b,
            (ParamValue::Float(a), ParamValue::Float(b)) => a.to_bits() == b.to_bits(),
            (ParamValue::Text(a), ParamValue::Text(b)) => a == b,
            (ParamValue::Bytes(a), ParamValue::Bytes(b)) => a == b,
            (ParamValue::List(a), ParamValue::List(b)) => a == b,
            (ParamValue::Map(a), ParamValue::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ParamValue {}

impl Hash for ParamValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ParamValue::Null => {}
            ParamValue::Bool(b) => b.hash(state),
            ParamValue::Int(i) => i.hash(state),
            ParamValue::Float(f) => f.to_bits().hash(state),
            ParamValue::Text(s) => s.hash(state),
            ParamValue::Bytes(b) => b.hash(state),
            ParamValue::List(l) => l.hash(state),
            ParamValue::Map(m) => m.hash(state),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl From<Vec<ParamValue>> for ParamValue {
    fn from(v: Vec<ParamValue>) -> Self {
        ParamValue::List(v)
    }
}

impl From<BTreeMap<String, ParamValue>> for ParamValue {
    fn from(v: BTreeMap<String, ParamValue>) -> Self {
        ParamValue::Map(v)
    }
}

/// A handler asked for a parameter that isn't there or has the wrong shape.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("`{logical_id}` has no parameter at position {position}")]
    Missing { logical_id: String, position: usize },

    #[error("`{logical_id}` parameter {position} should be {expected}, got {found}")]
    WrongKind {
        logical_id: String,
        position: usize,
        expected: &'static str,
        found: &'static str,
    },
}

// -----------------------------------------------------------------------------
// Message
// -----------------------------------------------------------------------------

/// An instruction addressed to one handler. Parameters are addressed by
/// position; the position *is* the schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Message {
    #[serde(rename = "id")]
    logical_id: String,
    #[serde(default)]
    parameters: Vec<ParamValue>,
}

impl Message {
    pub fn new(logical_id: impl Into<String>, parameters: Vec<ParamValue>) -> Self {
        Self {
            logical_id: logical_id.into(),
            parameters,
        }
    }

    /// A message that carries no parameters.
    pub fn bare(logical_id: impl Into<String>) -> Self {
        Self::new(logical_id, Vec::new())
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn parameters(&self) -> &[ParamValue] {
        &self.parameters
    }

    pub fn param(&self, position: usize) -> Result<&ParamValue, ParamError> {
        self.parameters.get(position).ok_or_else(|| ParamError::Missing {
            logical_id: self.logical_id.clone(),
            position,
        })
    }

    pub fn text(&self, position: usize) -> Result<&str, ParamError> {
        let value = self.param(position)?;
        value.as_text().ok_or_else(|| self.wrong_kind(position, "text", value))
    }

    pub fn int(&self, position: usize) -> Result<i64, ParamError> {
        let value = self.param(position)?;
        value.as_int().ok_or_else(|| self.wrong_kind(position, "int", value))
    }

    pub fn float(&self, position: usize) -> Result<f64, ParamError> {
        let value = self.param(position)?;
        value.as_float().ok_or_else(|| self.wrong_kind(position, "float", value))
    }

    pub fn bool(&self, position: usize) -> Result<bool, ParamError> {
        let value = self.param(position)?;
        value.as_bool().ok_or_else(|| self.wrong_kind(position, "bool", value))
    }

    fn wrong_kind(&self, position: usize, expected: &'static str, found: &ParamValue) -> ParamError {
        ParamError::WrongKind {
            logical_id: self.logical_id.clone(),
            position,
            expected,
            found: found.kind(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message(\"{}\") {{{} params}}", self.logical_id, self.parameters.len())
    }
}

// -----------------------------------------------------------------------------
// Sender identity
// -----------------------------------------------------------------------------

/// Who asked for an instruction or query. Only `stable_key` is identity; the
/// rest is display metadata that may change between releases of the sender.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SenderIdentity {
    pub stable_key: String,
    pub display_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub origin: Option<Url>,
    #[serde(default)]
    pub location_hint: String,
}

impl SenderIdentity {
    pub fn new(stable_key: impl Into<String>, display_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            stable_key: stable_key.into(),
            display_name: display_name.into(),
            version: version.into(),
            origin: None,
            location_hint: String::new(),
        }
    }

    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_location_hint(mut self, hint: impl Into<String>) -> Self {
        self.location_hint = hint.into();
        self
    }
}

impl PartialEq for SenderIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.stable_key == other.stable_key
    }
}

impl Eq for SenderIdentity {}

impl Hash for SenderIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.stable_key.hash(state);
    }
}

impl fmt::Display for SenderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{} v{}\"", self.display_name, self.version)
    }
}

// -----------------------------------------------------------------------------
// Payload codec
// -----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("could not encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// The codec used for every opaque block inside a frame (messages, sender
/// identities, query ids, query values, event params).
pub trait Wire: Serialize + DeserializeOwned {
    const WHAT: &'static str;

    fn to_wire(&self) -> Result<Bytes, CodecError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|source| CodecError::Encode { what: Self::WHAT, source })
    }

    fn from_wire(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|source| CodecError::Decode { what: Self::WHAT, source })
    }
}

impl Wire for Message {
    const WHAT: &'static str = "message";
}

impl Wire for SenderIdentity {
    const WHAT: &'static str = "sender identity";
}

impl Wire for ParamValue {
    const WHAT: &'static str = "parameter value";
}

impl Wire for String {
    const WHAT: &'static str = "logical id";
}
