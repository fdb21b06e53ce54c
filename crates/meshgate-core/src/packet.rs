//! Raw values delivered by a radio driver
//!
//! Drivers hand over decoded packets and node records as [`RawValue`]s.
//! Most of a record is already plain data, but some drivers leave nested
//! protobuf-style objects in place. Those implement [`DescribedMessage`]
//! and are converted one level at a time, so [`normalize`] keeps
//! descending until nothing described is left.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// An object that still carries a message descriptor
pub trait DescribedMessage: fmt::Debug + Send + Sync {
    /// Fully qualified message name, e.g. `meshtastic.User`
    fn descriptor_name(&self) -> &str;

    /// Convert one level into fields; children may still be described
    fn to_fields(&self) -> RawValue;
}

/// A value produced by a radio driver
#[derive(Debug, Clone)]
pub enum RawValue {
    /// Already plain data
    Plain(Value),
    /// Map whose entries may still need conversion
    Map(BTreeMap<String, RawValue>),
    /// Sequence whose items may still need conversion
    List(Vec<RawValue>),
    /// Protobuf-style object
    Message(Arc<dyn DescribedMessage>),
}

impl RawValue {
    /// Build a map from key/value pairs
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, RawValue)>,
    {
        RawValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Wrap a described message
    pub fn message(msg: impl DescribedMessage + 'static) -> Self {
        RawValue::Message(Arc::new(msg))
    }

    /// Whether this value (at the top level) is a described message
    pub fn is_described(&self) -> bool {
        matches!(self, RawValue::Message(_))
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        RawValue::Plain(value)
    }
}

/// Recursively convert a raw value into plain JSON
///
/// Plain values pass through unchanged. Conversion of a described
/// message can yield further described messages, which are converted
/// in turn.
pub fn normalize(raw: &RawValue) -> Value {
    match raw {
        RawValue::Plain(value) => value.clone(),
        RawValue::Map(entries) => {
            let mut out = Map::with_capacity(entries.len());
            for (key, value) in entries {
                out.insert(key.clone(), normalize(value));
            }
            Value::Object(out)
        }
        RawValue::List(items) => Value::Array(items.iter().map(normalize).collect()),
        RawValue::Message(msg) => normalize(&msg.to_fields()),
    }
}

/// Normalize an optional raw value, mapping `null` to `None`
pub fn normalize_opt(raw: Option<&RawValue>) -> Option<Value> {
    raw.map(normalize).filter(|v| !v.is_null())
}
