//! CloudEvent wire form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default `specversion` for events built with [`CloudEvent::new`].
pub const SPEC_VERSION: &str = "1.0";

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// Boolean.
    Bool(bool),
    /// 32-bit signed integer.
    Integer(i32),
    /// Text.
    String(String),
    /// Binary.
    Bytes(Vec<u8>),
    /// Absolute URI.
    Uri(String),
    /// URI reference.
    UriRef(String),
    /// Timestamp.
    Timestamp(DateTime<Utc>),
}

impl AttributeValue {
    /// Text form of string-like values.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) | AttributeValue::Uri(s) | AttributeValue::UriRef(s) => {
                Some(s)
            }
            _ => None,
        }
    }
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventData {
    /// Raw bytes.
    Binary(Vec<u8>),
    /// UTF-8 text.
    Text(String),
    /// An encoded protobuf message.
    Proto {
        /// Type URL of the message.
        type_url: String,
        /// Encoded message bytes.
        value: Vec<u8>,
    },
}

/// An event as clients send and receive it.
///
/// `datacontenttype`, `dataschema`, `subject` and `time` travel in
/// `attributes` alongside extension attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudEvent {
    /// Identifier.
    pub id: String,
    /// Source.
    pub source: String,
    /// Spec version.
    pub spec_version: String,
    /// Type.
    #[serde(rename = "type")]
    pub ty: String,
    /// Optional and extension attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Payload.
    #[serde(default)]
    pub data: Option<EventData>,
}

impl CloudEvent {
    /// Event with the required attributes and spec version `1.0`.
    #[must_use]
    pub fn new(id: impl Into<String>, source: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            spec_version: SPEC_VERSION.to_string(),
            ty: ty.into(),
            attributes: BTreeMap::new(),
            data: None,
        }
    }

    /// Builder helper setting one attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Builder helper setting the payload.
    #[must_use]
    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = Some(data);
        self
    }
}
