//! Raw filesystem notifications and the semantic scheme events derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identity of whoever caused a change.
///
/// Every store owns one; events carrying it are the store's own writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requestor(Uuid);

impl Requestor {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Requestor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Requestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RawEventKind {
    ContentChanged,
    Created,
    Deleted,
}

/// One notification from a change-event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub kind: RawEventKind,
    /// Logical path, `/`-separated.
    pub path: String,
    pub is_directory: bool,
    /// `None` when the source cannot tell who caused the change.
    pub requestor: Option<Requestor>,
}

impl RawEvent {
    pub fn file(kind: RawEventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            is_directory: false,
            requestor: None,
        }
    }

    pub fn directory(kind: RawEventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            is_directory: true,
            requestor: None,
        }
    }

    pub fn with_requestor(mut self, requestor: Requestor) -> Self {
        self.requestor = Some(requestor);
        self
    }
}

/// A scheme file inside the managed directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemeFile {
    /// File name including extension, without the directory.
    pub name: String,
}

impl SchemeFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Semantic change, consumed exactly once by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemeChangeEvent {
    UpdateScheme(SchemeFile),
    AddScheme(SchemeFile),
    RemoveScheme(String),
    RemoveAllSchemes,
}

impl SchemeChangeEvent {
    /// File name the event is about, `None` for `RemoveAllSchemes`.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            SchemeChangeEvent::UpdateScheme(file) | SchemeChangeEvent::AddScheme(file) => {
                Some(&file.name)
            }
            SchemeChangeEvent::RemoveScheme(name) => Some(name),
            SchemeChangeEvent::RemoveAllSchemes => None,
        }
    }

    /// Whether executing the event mutates the store without reading a file.
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            SchemeChangeEvent::RemoveScheme(_) | SchemeChangeEvent::RemoveAllSchemes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requestors_are_distinct() {
        assert_ne!(Requestor::new(), Requestor::new());
    }

    #[test]
    fn test_raw_event_serialization() {
        let event = RawEvent::directory(RawEventKind::Created, "codestyles");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"created\""));
        assert!(json.contains("\"isDirectory\":true"));
    }

    #[test]
    fn test_event_file_names() {
        let add = SchemeChangeEvent::AddScheme(SchemeFile::new("a.json"));
        assert_eq!(add.file_name(), Some("a.json"));
        assert!(!add.is_removal());

        let remove = SchemeChangeEvent::RemoveScheme("a.json".into());
        assert_eq!(remove.file_name(), Some("a.json"));
        assert!(remove.is_removal());

        assert_eq!(SchemeChangeEvent::RemoveAllSchemes.file_name(), None);
        assert!(SchemeChangeEvent::RemoveAllSchemes.is_removal());
    }
}
