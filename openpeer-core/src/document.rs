// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::location::PeerUri;

/// Member under which a contact-list document keeps its peer URIs.
pub const CONTACTS_KEY: &str = "contacts";

/// Structured publication body: a JSON object.
///
/// Every structured payload, diff document and relationship document in the
/// stack is one of these. The wrapper stays close to raw `serde_json` so
/// callers can build documents with `json!` and hand them straight in.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wraps a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DocumentError::NotAnObject(value_kind(&other))),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Builds the well-known contact-list document shape from a set of peer
    /// URIs.
    pub fn from_contact_list<'a>(contacts: impl IntoIterator<Item = &'a PeerUri>) -> Self {
        let uris: Vec<Value> = contacts
            .into_iter()
            .map(|uri| Value::String(uri.as_str().to_string()))
            .collect();
        let mut map = Map::new();
        map.insert(CONTACTS_KEY.to_string(), Value::Array(uris));
        Self(map)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // A string-keyed map of JSON values always serializes.
        serde_json::to_vec(&self.0).expect("JSON object failed to serialize")
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    /// Peer URIs listed in this document's contact-list member.
    ///
    /// Documents without the member, or with entries that are not strings,
    /// yield no contacts; relationship resolution treats them as empty lists
    /// rather than errors.
    pub fn contact_list(&self) -> Vec<PeerUri> {
        match self.0.get(CONTACTS_KEY) {
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(|entry| entry.as_str().map(PeerUri::from))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Rough in-memory size of the serialized document, used for transfer
    /// size estimation.
    pub fn size(&self) -> usize {
        self.to_bytes().len()
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("document root must be an object, found {0}")]
    NotAnObject(&'static str),

    #[error("invalid document encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_objects_only() {
        let document = Document::from_bytes(br#"{"profile":{"alias":"ana"}}"#).unwrap();
        assert_eq!(document.get("profile"), Some(&json!({"alias": "ana"})));

        assert_matches!(
            Document::from_bytes(b"[1, 2, 3]"),
            Err(DocumentError::NotAnObject("array"))
        );
        assert_matches!(
            Document::from_bytes(b"not json at all"),
            Err(DocumentError::Encoding(_))
        );
    }

    #[test]
    fn bytes_round_trip() {
        let document =
            Document::from_value(json!({ "a": { "b": 7 }, "c": [1, 2] })).unwrap();
        let decoded = Document::from_bytes(&document.to_bytes()).unwrap();
        assert_eq!(document, decoded);
    }

    #[test]
    fn contact_list_extraction() {
        let contacts = [PeerUri::from("peer://alice"), PeerUri::from("peer://bob")];
        let document = Document::from_contact_list(&contacts);
        assert_eq!(document.contact_list(), contacts.to_vec());

        // Non-string entries are skipped, malformed shapes yield nothing.
        let mixed = Document::from_value(json!({ "contacts": ["peer://carol", 42] })).unwrap();
        assert_eq!(mixed.contact_list(), vec![PeerUri::from("peer://carol")]);

        let wrong_shape = Document::from_value(json!({ "contacts": "peer://dave" })).unwrap();
        assert!(wrong_shape.contact_list().is_empty());

        let absent = Document::from_value(json!({ "other": [] })).unwrap();
        assert!(absent.contact_list().is_empty());
    }
}
