//! Document: the canonical serialized tree of a scheme.
//!
//! The store never looks inside a document except through the serializer's
//! key extraction. Canonical bytes are pretty-printed JSON with object keys in
//! sorted order, so equal trees always produce equal digests.

use crate::digest::Digest;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid document: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// Name of the root attribute holding the scheme key.
pub const NAME_ATTRIBUTE: &str = "name";

/// Parsed scheme document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    root: Value,
}

impl Document {
    /// Wrap a tree. The root must be an object.
    pub fn new(root: Value) -> Result<Self> {
        if !root.is_object() {
            return Err(DocumentError::Invalid("root must be an object".into()));
        }
        Ok(Self { root })
    }

    /// Parse canonical or hand-edited bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::new(serde_json::from_slice(bytes)?)
    }

    /// Canonical form (LF line separators, sorted keys, trailing newline).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(&self.root)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Digest of the canonical form.
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::of(&self.to_bytes()?))
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn into_root(self) -> Value {
        self.root
    }

    /// String attribute of the root object.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.root.get(name).and_then(Value::as_str)
    }

    /// Whether the root carries nothing but (at most) its name.
    pub fn is_empty(&self) -> bool {
        self.root
            .as_object()
            .map_or(true, |map| map.keys().all(|k| k == NAME_ATTRIBUTE))
    }
}

#[derive(Deserialize)]
struct NameProbe {
    #[serde(default)]
    name: Option<String>,
}

/// Extract the root `name` attribute straight from bytes.
///
/// Every other field is skipped without being materialized, which keeps the
/// probe cheap for large schemes.
pub fn probe_name(bytes: &[u8]) -> Option<String> {
    serde_json::from_slice::<NameProbe>(bytes)
        .ok()
        .and_then(|probe| probe.name)
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_bytes_sort_keys() {
        let a = Document::from_bytes(br#"{"b": 1, "a": 2, "name": "X"}"#).unwrap();
        let b = Document::new(json!({"name": "X", "a": 2, "b": 1})).unwrap();
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn test_root_must_be_object() {
        assert!(matches!(
            Document::from_bytes(b"[1, 2]"),
            Err(DocumentError::Invalid(_))
        ));
        assert!(matches!(
            Document::from_bytes(b"not json"),
            Err(DocumentError::Parse(_))
        ));
    }

    #[test]
    fn test_attribute_and_emptiness() {
        let doc = Document::new(json!({"name": "Darcula"})).unwrap();
        assert_eq!(doc.attribute("name"), Some("Darcula"));
        assert!(doc.is_empty());

        let doc = Document::new(json!({"name": "Darcula", "font": 12})).unwrap();
        assert!(!doc.is_empty());
        assert_eq!(doc.attribute("font"), None);
    }

    #[test]
    fn test_probe_name() {
        assert_eq!(
            probe_name(br#"{"options": {"deep": [1, 2, 3]}, "name": "Foo"}"#),
            Some("Foo".to_string())
        );
        assert_eq!(probe_name(br#"{"options": {}}"#), None);
        assert_eq!(probe_name(br#"{"name": ""}"#), None);
        assert_eq!(probe_name(b"garbage"), None);
    }
}
