//! Persistence metadata of a file-backed scheme.

use crate::digest::Digest;
use std::collections::HashSet;
use tracing::debug;

/// Where a scheme was last read from or written to, and what it looked like.
///
/// Every scheme believed to be backed by a file has exactly one
/// `ExternalInfo`; infos are never shared between live schemes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalInfo {
    file_name_without_extension: String,
    file_extension: Option<String>,
    /// Key at the time of last persistence, compared against the current key
    /// to detect a rename.
    scheme_key: Option<String>,
    /// `None` until the content has been hashed.
    digest: Option<Digest>,
}

impl ExternalInfo {
    pub fn new(file_name_without_extension: &str, file_extension: Option<&str>) -> Self {
        Self {
            file_name_without_extension: file_name_without_extension.to_string(),
            file_extension: file_extension.map(str::to_string),
            scheme_key: None,
            digest: None,
        }
    }

    pub fn file_name_without_extension(&self) -> &str {
        &self.file_name_without_extension
    }

    pub fn file_extension(&self) -> Option<&str> {
        self.file_extension.as_deref()
    }

    pub fn file_name(&self) -> String {
        match &self.file_extension {
            Some(ext) => format!("{}{}", self.file_name_without_extension, ext),
            None => self.file_name_without_extension.clone(),
        }
    }

    pub fn set_file_name_without_extension(&mut self, name: &str, extension: &str) {
        self.file_name_without_extension = name.to_string();
        self.file_extension = Some(extension.to_string());
    }

    pub fn scheme_key(&self) -> Option<&str> {
        self.scheme_key.as_deref()
    }

    pub fn set_scheme_key(&mut self, key: impl Into<String>) {
        self.scheme_key = Some(key.into());
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    pub fn set_digest(&mut self, digest: Digest) {
        self.digest = Some(digest);
    }

    pub fn is_digest_equals(&self, digest: &Digest) -> bool {
        self.digest.as_ref() == Some(digest)
    }

    /// Whether the scheme's current key differs from the persisted one.
    pub fn is_renamed(&self, current_key: &str) -> bool {
        self.scheme_key.as_deref().is_some_and(|k| k != current_key)
    }

    /// Add this info's file to a deletion set.
    pub fn schedule_delete(&self, files_to_delete: &mut HashSet<String>, reason: &str) {
        let file_name = self.file_name();
        debug!("Schedule to delete: {} (reason: {})", file_name, reason);
        files_to_delete.insert(file_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_concatenation() {
        let info = ExternalInfo::new("Default", Some(".json"));
        assert_eq!(info.file_name(), "Default.json");

        let bare = ExternalInfo::new("README", None);
        assert_eq!(bare.file_name(), "README");
    }

    #[test]
    fn test_rename_detection() {
        let mut info = ExternalInfo::new("Foo", Some(".json"));
        // never persisted with a key: nothing to compare against
        assert!(!info.is_renamed("Bar"));

        info.set_scheme_key("Foo");
        assert!(!info.is_renamed("Foo"));
        assert!(info.is_renamed("Bar"));
    }

    #[test]
    fn test_digest_equality() {
        let mut info = ExternalInfo::new("Foo", Some(".json"));
        let digest = Digest::of(b"content");
        assert!(!info.is_digest_equals(&digest));

        info.set_digest(digest);
        assert!(info.is_digest_equals(&Digest::of(b"content")));
        assert!(!info.is_digest_equals(&Digest::of(b"other")));
    }

    #[test]
    fn test_schedule_delete_uses_current_file_name() {
        let mut info = ExternalInfo::new("Old", Some(".json"));
        info.set_file_name_without_extension("New", ".scheme");

        let mut files = HashSet::new();
        info.schedule_delete(&mut files, "test");
        assert!(files.contains("New.scheme"));
    }
}
