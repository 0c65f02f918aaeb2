use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Request or response body as seen by a service.
///
/// Transports hand over raw bytes; services may replace the response with a
/// structured JSON value which the response shaper serializes later.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    /// Nothing was produced (or the request had no body).
    #[default]
    Empty,
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes, passed through untouched.
    Bytes(Bytes),
    /// A structured value.
    Json(serde_json::Value),
}

impl Payload {
    /// Returns `true` for `Empty`, empty text and empty bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.is_empty(),
            Self::Bytes(b) => b.is_empty(),
            Self::Json(_) => false,
        }
    }

    /// Returns the structured value, if this payload holds one.
    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Builds a payload from raw bytes, preferring `Text` when they are valid UTF-8.
    #[must_use]
    pub fn from_raw(raw: Bytes) -> Self {
        if raw.is_empty() {
            return Self::Empty;
        }
        match std::str::from_utf8(&raw) {
            Ok(text) => Self::Text(text.to_string()),
            Err(_) => Self::Bytes(raw),
        }
    }

    /// Converts the payload into a JSON value: text that parses as JSON is
    /// parsed, other text becomes a JSON string, `Empty` becomes `null`.
    #[must_use]
    pub fn to_json_value(&self) -> serde_json::Value {
        match self {
            Self::Empty => serde_json::Value::Null,
            Self::Text(s) => serde_json::from_str(s)
                .unwrap_or_else(|_| serde_json::Value::String(s.clone())),
            Self::Bytes(b) => serde_json::from_slice(b).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(b).into_owned())
            }),
            Self::Json(v) => v.clone(),
        }
    }

    /// Serializes the payload to a JSON string (`to_json_string` on async invocations).
    #[must_use]
    pub fn to_json_string(&self) -> String {
        match self {
            Self::Json(v) => v.to_string(),
            other => other.to_json_value().to_string(),
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// A single request parameter. Keys given once are scalars; keys repeated in
/// the query string keep every value in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Single(String),
    Multi(Vec<String>),
}

impl ParamValue {
    /// The first (or only) value.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::Single(s) => Some(s),
            Self::Multi(v) => v.first().map(String::as_str),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

/// Parameters keyed by name. `BTreeMap` keeps them sorted, which request
/// fingerprinting relies on.
pub type ChannelParams = BTreeMap<String, ParamValue>;

/// A response as stored in, and served from, a response cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub status_code: u16,
}

impl CacheEntry {
    /// Encodes the entry for a byte-oriented cache backend.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails, which only happens for
    /// pathological header maps.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes an entry previously produced by [`CacheEntry::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoded entry.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}
