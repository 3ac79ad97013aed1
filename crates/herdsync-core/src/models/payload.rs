//! Schema-agnostic record payload

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single payload value
///
/// Serialized untagged, so a payload reads as plain JSON on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<PayloadValue>),
    Map(BTreeMap<String, PayloadValue>),
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for PayloadValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<Self>> From<Vec<T>> for PayloadValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Ordered string-keyed map of domain fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, PayloadValue>);

impl Payload {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PayloadValue>,
    ) -> Option<PayloadValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        self.0.get(key)
    }

    /// Text value for `key`, if present and textual
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(PayloadValue::Text(value)) => Some(value),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<PayloadValue> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PayloadValue)> {
        self.0.iter()
    }

    /// Length of the JSON encoding, used for quota accounting
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |bytes| bytes.len())
    }
}

impl<K: Into<String>, V: Into<PayloadValue>> FromIterator<(K, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn payload_serializes_as_plain_json_object() {
        let payload = Payload::new()
            .with("name", "Bessie")
            .with("weight_kg", 612_i64)
            .with("vaccinated", true);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "Bessie", "vaccinated": true, "weight_kg": 612})
        );
    }

    #[test]
    fn payload_parses_nested_values() {
        let payload: Payload = serde_json::from_str(
            r#"{"name":"Bessie","score":4.5,"tags":["dairy","show"],"pen":{"row":3},"note":null}"#,
        )
        .unwrap();

        assert_eq!(payload.text("name"), Some("Bessie"));
        assert_eq!(payload.get("score"), Some(&PayloadValue::Float(4.5)));
        assert_eq!(
            payload.get("tags"),
            Some(&PayloadValue::from(vec!["dairy", "show"]))
        );
        assert!(matches!(payload.get("pen"), Some(PayloadValue::Map(map)) if map.len() == 1));
        assert_eq!(payload.get("note"), Some(&PayloadValue::Null));
    }

    #[test]
    fn payload_keys_are_ordered() {
        let payload: Payload = [("b", 1_i64), ("a", 2), ("c", 3)].into_iter().collect();
        let keys: Vec<&String> = payload.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn encoded_len_tracks_json_size() {
        let empty = Payload::new();
        assert_eq!(empty.encoded_len(), 2);

        let payload = Payload::new().with("k", "v");
        assert_eq!(payload.encoded_len(), r#"{"k":"v"}"#.len());
    }
}
