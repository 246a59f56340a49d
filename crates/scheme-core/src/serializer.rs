//! Serializer contract: scheme <-> canonical document, plus hashing.

use crate::digest::Digest;
use crate::document::{self, Document, DocumentError};

/// Converts schemes to canonical documents and back.
///
/// Implementations must be deterministic: serializing an unmodified scheme
/// twice must yield equal documents, or every save rewrites the file.
pub trait SchemeSerializer<S>: Send + Sync {
    /// Serialize a scheme. `Ok(None)` means there is nothing to persist, and
    /// any file backing the scheme is scheduled for deletion.
    fn serialize(&self, scheme: &S) -> Result<Option<Document>, DocumentError>;

    /// Build a scheme from its document. `bundled` is set for read-only
    /// defaults shipped with the application.
    fn deserialize(&self, document: Document, key: &str, bundled: bool) -> Result<S, DocumentError>;

    /// Parse raw file bytes.
    fn parse(&self, bytes: &[u8]) -> Result<Document, DocumentError> {
        Document::from_bytes(bytes)
    }

    /// Identity key recorded in a parsed document.
    fn extract_key(&self, document: &Document) -> Option<String> {
        document
            .attribute(document::NAME_ATTRIBUTE)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }

    /// Identity key from raw bytes, without building the document tree.
    fn preload_key(&self, bytes: &[u8]) -> Option<String> {
        document::probe_name(bytes)
    }

    fn digest(&self, bytes: &[u8]) -> Digest {
        Digest::of(bytes)
    }
}
