//! Roaming stream provider: a byte-oriented store of named blobs that can
//! stand in for the local scheme directory (e.g. settings sync).
//!
//! When a provider is configured and claims a directory, the store reads and
//! writes through it and never touches the local filesystem for that
//! directory.

use crate::fs::{FsError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// How a scheme directory roams between machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoamingType {
    /// Shared across all machines of the user.
    #[default]
    Default,
    /// Shared only between machines running the same OS.
    PerOs,
    /// Never leaves this machine.
    Disabled,
}

/// Remote (or otherwise non-local) storage for scheme files.
pub trait StreamProvider: Send + Sync {
    /// Whether this provider serves `path` for the given roaming type.
    fn is_applicable(&self, path: &str, roaming_type: RoamingType) -> bool;

    /// Visit the children of `dir` accepted by `filter`.
    ///
    /// `visitor` receives `(name, bytes, read_only)` and returns `false` to
    /// stop the enumeration early. Entries are produced lazily, one at a time.
    fn process_children(
        &self,
        dir: &str,
        roaming_type: RoamingType,
        filter: &dyn Fn(&str) -> bool,
        visitor: &mut dyn FnMut(&str, &[u8], bool) -> bool,
    ) -> Result<()>;

    /// Write `content` to `path`.
    fn write(&self, path: &str, content: &[u8], roaming_type: RoamingType) -> Result<()>;

    /// Delete `path`. Returns `false` if the provider did not handle the path.
    fn delete(&self, path: &str, roaming_type: RoamingType) -> Result<bool>;
}

/// In-memory provider for testing
pub struct InMemoryProvider {
    roaming_type: RoamingType,
    blobs: RwLock<BTreeMap<String, (Vec<u8>, bool)>>,
    failing: RwLock<HashSet<String>>,
}

impl InMemoryProvider {
    /// Create a provider that claims every path of the given roaming type.
    pub fn new(roaming_type: RoamingType) -> Self {
        Self {
            roaming_type,
            blobs: RwLock::new(BTreeMap::new()),
            failing: RwLock::new(HashSet::new()),
        }
    }

    /// Seed a blob, optionally marked read-only (bundled by the remote side).
    pub fn insert(&self, path: &str, content: &[u8], read_only: bool) {
        self.blobs
            .write()
            .insert(normalize(path), (content.to_vec(), read_only));
    }

    /// Read back a blob.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.read().get(&normalize(path)).map(|(b, _)| b.clone())
    }

    /// Make reads of `path` fail, for exercising per-file error recovery.
    pub fn set_failing(&self, path: &str) {
        self.failing.write().insert(normalize(path));
    }

    /// All stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.blobs.read().keys().cloned().collect()
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl StreamProvider for InMemoryProvider {
    fn is_applicable(&self, _path: &str, roaming_type: RoamingType) -> bool {
        roaming_type != RoamingType::Disabled && roaming_type == self.roaming_type
    }

    fn process_children(
        &self,
        dir: &str,
        roaming_type: RoamingType,
        filter: &dyn Fn(&str) -> bool,
        visitor: &mut dyn FnMut(&str, &[u8], bool) -> bool,
    ) -> Result<()> {
        if !self.is_applicable(dir, roaming_type) {
            return Ok(());
        }
        let prefix = format!("{}/", normalize(dir));

        // Snapshot so the visitor may write back through the provider
        let children: Vec<(String, Vec<u8>, bool)> = self
            .blobs
            .read()
            .iter()
            .filter_map(|(path, (bytes, read_only))| {
                let name = path.strip_prefix(&prefix)?;
                (!name.contains('/')).then(|| (name.to_string(), bytes.clone(), *read_only))
            })
            .collect();

        for (name, bytes, read_only) in children {
            if !filter(&name) {
                continue;
            }
            if self.failing.read().contains(&format!("{}{}", prefix, name)) {
                return Err(FsError::Io(format!("cannot read {}{}", prefix, name)));
            }
            if !visitor(&name, &bytes, read_only) {
                break;
            }
        }
        Ok(())
    }

    fn write(&self, path: &str, content: &[u8], roaming_type: RoamingType) -> Result<()> {
        if !self.is_applicable(path, roaming_type) {
            return Err(FsError::Io(format!("provider does not serve {}", path)));
        }
        self.blobs
            .write()
            .insert(normalize(path), (content.to_vec(), false));
        Ok(())
    }

    fn delete(&self, path: &str, roaming_type: RoamingType) -> Result<bool> {
        if !self.is_applicable(path, roaming_type) {
            return Ok(false);
        }
        self.blobs.write().remove(&normalize(path));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_children_filters_and_stops() {
        let provider = InMemoryProvider::new(RoamingType::Default);
        provider.insert("schemes/a.json", b"a", false);
        provider.insert("schemes/b.json", b"b", true);
        provider.insert("schemes/c.txt", b"c", false);
        provider.insert("schemes/nested/d.json", b"d", false);
        provider.insert("other/e.json", b"e", false);

        let mut seen = Vec::new();
        provider
            .process_children(
                "schemes",
                RoamingType::Default,
                &|name| name.ends_with(".json"),
                &mut |name, bytes, read_only| {
                    seen.push((name.to_string(), bytes.to_vec(), read_only));
                    true
                },
            )
            .unwrap();
        assert_eq!(
            seen,
            vec![
                ("a.json".to_string(), b"a".to_vec(), false),
                ("b.json".to_string(), b"b".to_vec(), true),
            ]
        );

        let mut count = 0;
        provider
            .process_children("schemes", RoamingType::Default, &|_| true, &mut |_, _, _| {
                count += 1;
                false
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_disabled_roaming_is_never_applicable() {
        let provider = InMemoryProvider::new(RoamingType::Default);
        assert!(provider.is_applicable("schemes", RoamingType::Default));
        assert!(!provider.is_applicable("schemes", RoamingType::Disabled));
        assert!(!provider.delete("schemes/a.json", RoamingType::PerOs).unwrap());
    }

    #[test]
    fn test_roaming_type_serialization() {
        let json = serde_json::to_string(&RoamingType::PerOs).unwrap();
        assert_eq!(json, "\"perOs\"");
        let parsed: RoamingType = serde_json::from_str("\"disabled\"").unwrap();
        assert_eq!(parsed, RoamingType::Disabled);
    }
}
