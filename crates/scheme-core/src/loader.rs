//! One-shot load pass.
//!
//! A loader starts from the store's current list, reads candidate files into
//! a private copy, and publishes the result with a single compare-and-swap in
//! [`SchemeLoader::apply`]. While it lives it holds the store's pending
//! deletions, so a concurrent save cannot delete a file this pass is about to
//! read; they go back to the store when the loader is applied or dropped.
//!
//! A file missing from the directory is not a deletion here. Only an explicit
//! remove event takes a scheme away.

use crate::external_info::ExternalInfo;
use crate::scheme::{SchemeId, SchemeRef};
use crate::store::{Result, SchemeStore, StoreError};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// What loading a file does to a scheme already in the list.
enum Existing {
    /// Nothing with this key yet.
    None,
    /// Same file read again: replace the scheme.
    Replace(usize),
    /// A bundled default with this key: the user scheme takes its place.
    Shadow(usize),
    /// Same stem from the legacy extension: replace and delete the legacy file.
    ReplaceLegacy(usize),
    /// This file is the legacy twin of a scheme already read.
    SkipLegacy,
    /// Another file already defines this key.
    Duplicate,
}

pub struct SchemeLoader<'a, S> {
    store: &'a SchemeStore<S>,
    old_list: Arc<Vec<SchemeRef<S>>>,
    old_infos: HashMap<SchemeId, ExternalInfo>,
    bundled: HashSet<SchemeId>,
    schemes: Vec<SchemeRef<S>>,
    new_infos: HashMap<SchemeId, ExternalInfo>,
    /// Schemes of the old list replaced by this pass.
    replaced: Vec<SchemeRef<S>>,
    added: Vec<SchemeRef<S>>,
    read_only: Vec<(String, SchemeRef<S>)>,
    /// Borrowed from the store, plus whatever this pass schedules.
    files_to_delete: HashSet<String>,
    applied: bool,
}

impl<'a, S> SchemeLoader<'a, S> {
    pub(crate) fn new(store: &'a SchemeStore<S>) -> Self {
        let old_list = store.schemes.load();
        let (old_infos, bundled) = {
            let state = store.state.lock();
            (state.infos.clone(), state.bundled_ids())
        };
        let files_to_delete = std::mem::take(&mut *store.files_to_delete.lock());

        Self {
            store,
            schemes: (*old_list).clone(),
            old_list,
            old_infos,
            bundled,
            new_infos: HashMap::new(),
            replaced: Vec::new(),
            added: Vec::new(),
            read_only: Vec::new(),
            files_to_delete,
            applied: false,
        }
    }

    /// Schemes read so far.
    pub fn loaded(&self) -> &[SchemeRef<S>] {
        &self.added
    }

    fn info_of(&self, scheme: &SchemeRef<S>) -> Option<&ExternalInfo> {
        self.new_infos
            .get(&scheme.id())
            .or_else(|| self.old_infos.get(&scheme.id()))
    }

    /// Read one file. `Ok(None)` means the file was deliberately skipped.
    pub fn load_scheme(
        &mut self,
        file_name: &str,
        bytes: &[u8],
        read_only: bool,
    ) -> Result<Option<SchemeRef<S>>> {
        let store = self.store;
        let Some((stem, extension)) = store.split_scheme_file_name(file_name) else {
            return Err(StoreError::UnknownExtension {
                file: file_name.to_string(),
            });
        };
        if self.files_to_delete.contains(file_name) {
            warn!("Scheme file {} is not loaded because it is scheduled for deletion", file_name);
            return Ok(None);
        }

        let key = self.preload_key(file_name, stem, bytes)?;
        let existing = self.resolve_existing(file_name, &key, stem, extension);
        match existing {
            Existing::Duplicate => {
                warn!(
                    "Scheme {} from {} is already loaded in {}, skipped",
                    key,
                    file_name,
                    store.config().name()
                );
                return Ok(None);
            }
            Existing::SkipLegacy => {
                debug!("Schedule to delete: {} (reason: legacy duplicate)", file_name);
                self.files_to_delete.insert(file_name.to_string());
                return Ok(None);
            }
            _ => {}
        }

        let document = store.serializer.parse(bytes)?;
        let digest = store.serializer.digest(&document.to_bytes()?);
        let scheme = store
            .serializer
            .deserialize(document, &key, read_only)
            .map_err(|e| StoreError::Read {
                file: file_name.to_string(),
                message: e.to_string(),
            })?;
        let scheme = store.new_ref(scheme);

        let actual_key = store.processor.scheme_key(&scheme);
        if actual_key != key {
            debug!("Scheme in {} announced key {} but is named {}", file_name, key, actual_key);
        }

        match existing {
            Existing::None => self.schemes.push(scheme.clone()),
            Existing::Replace(index) | Existing::Shadow(index) => {
                let old = std::mem::replace(&mut self.schemes[index], scheme.clone());
                self.forget(old);
            }
            Existing::ReplaceLegacy(index) => {
                let old = std::mem::replace(&mut self.schemes[index], scheme.clone());
                if let Some(info) = self.info_of(&old).cloned() {
                    info.schedule_delete(&mut self.files_to_delete, "legacy extension");
                }
                self.forget(old);
            }
            Existing::SkipLegacy | Existing::Duplicate => {}
        }

        let mut info = ExternalInfo::new(stem, Some(extension));
        info.set_scheme_key(actual_key);
        info.set_digest(digest);
        self.new_infos.insert(scheme.id(), info);
        if read_only {
            self.bundled.insert(scheme.id());
            self.read_only.push((key, scheme.clone()));
        }
        self.added.push(scheme.clone());
        Ok(Some(scheme))
    }

    /// Key from a cheap probe of the bytes, falling back to the file name.
    fn preload_key(&self, file_name: &str, stem: &str, bytes: &[u8]) -> Result<String> {
        if let Some(key) = self.store.serializer.preload_key(bytes) {
            return Ok(key);
        }
        let fallback = match self.store.processor.as_lazy() {
            Some(lazy) => lazy.scheme_key(bytes, stem),
            None => Some(stem.to_string()),
        };
        fallback
            .filter(|key| !key.is_empty())
            .ok_or_else(|| StoreError::NameMissing {
                file: file_name.to_string(),
            })
    }

    fn resolve_existing(&self, file_name: &str, key: &str, stem: &str, extension: &str) -> Existing {
        let same_file = self.schemes.iter().position(|scheme| {
            !self.bundled.contains(&scheme.id())
                && self
                    .info_of(scheme)
                    .is_some_and(|info| info.file_name() == file_name)
        });
        if let Some(index) = same_file {
            return Existing::Replace(index);
        }

        let processor = &self.store.processor;
        let Some(index) = self
            .schemes
            .iter()
            .position(|scheme| processor.scheme_key(scheme) == key)
        else {
            return Existing::None;
        };
        let existing = &self.schemes[index];
        if self.bundled.contains(&existing.id()) {
            return Existing::Shadow(index);
        }
        match self.info_of(existing) {
            Some(info) if info.file_name_without_extension() == stem => {
                if info.file_extension() == Some(self.store.extension()) && extension != self.store.extension() {
                    Existing::SkipLegacy
                } else {
                    Existing::ReplaceLegacy(index)
                }
            }
            _ => Existing::Duplicate,
        }
    }

    /// Bookkeeping for a scheme this pass took out of the list.
    fn forget(&mut self, old: SchemeRef<S>) {
        if let Some(pos) = self.added.iter().position(|s| *s == old) {
            self.added.remove(pos);
            self.new_infos.remove(&old.id());
            self.read_only.retain(|(_, s)| *s != old);
        } else if self.old_list.contains(&old) && !self.bundled.contains(&old.id()) {
            self.replaced.push(old);
        }
    }

    /// Publish the new list and return the schemes this pass read.
    pub fn apply(mut self) -> Result<Vec<SchemeRef<S>>> {
        let store = self.store;
        self.applied = true;
        store
            .files_to_delete
            .lock()
            .extend(std::mem::take(&mut self.files_to_delete));

        let schemes = std::mem::take(&mut self.schemes);
        let published = match store.schemes.compare_and_swap(&self.old_list, schemes) {
            Ok(published) => published,
            Err(_) => {
                warn!("Scheme list of {} changed during load", store.config().name());
                return Err(StoreError::ConcurrentModification);
            }
        };

        {
            let mut state = store.state.lock();
            for old in &self.replaced {
                state.infos.remove(&old.id());
            }
            state.infos.extend(self.new_infos.drain());
            for (key, scheme) in self.read_only.drain(..) {
                if state.read_only.insert(key.clone(), scheme).is_some() {
                    debug!("Bundled scheme {} registered twice, keeping the last", key);
                }
            }
        }

        store.demote_active_if(|active| !published.contains(active));
        for old in &self.replaced {
            store.processor.on_scheme_deleted(old);
        }
        for scheme in &self.added {
            store.processor.on_scheme_added(scheme);
        }
        Ok(std::mem::take(&mut self.added))
    }
}

impl<S> Drop for SchemeLoader<'_, S> {
    fn drop(&mut self) {
        if !self.applied && !self.files_to_delete.is_empty() {
            self.store
                .files_to_delete
                .lock()
                .extend(self.files_to_delete.drain());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::document::{Document, DocumentError};
    use crate::fs::InMemoryFs;
    use crate::processor::SchemeProcessor;
    use crate::serializer::SchemeSerializer;
    use serde_json::json;

    struct Named;

    impl SchemeSerializer<String> for Named {
        fn serialize(&self, scheme: &String) -> std::result::Result<Option<Document>, DocumentError> {
            Document::new(json!({ "name": scheme, "value": 1 })).map(Some)
        }

        fn deserialize(
            &self,
            _document: Document,
            key: &str,
            _bundled: bool,
        ) -> std::result::Result<String, DocumentError> {
            Ok(key.to_string())
        }
    }

    impl SchemeProcessor<String> for Named {
        fn scheme_key(&self, scheme: &String) -> String {
            scheme.clone()
        }
    }

    fn store() -> SchemeStore<String> {
        SchemeStore::new(
            StoreConfig::new("schemes"),
            Arc::new(Named),
            Arc::new(Named),
            Arc::new(InMemoryFs::new()),
        )
    }

    fn bytes(name: &str) -> Vec<u8> {
        Document::new(json!({ "name": name, "value": 1 }))
            .unwrap()
            .to_bytes()
            .unwrap()
    }

    #[test]
    fn test_loader_borrows_pending_deletions() {
        let store = store();
        store.files_to_delete.lock().insert("old.json".to_string());

        let loader = SchemeLoader::new(&store);
        assert!(store.files_to_delete().is_empty());
        drop(loader);

        assert_eq!(store.files_to_delete(), vec!["old.json".to_string()]);
    }

    #[test]
    fn test_scheduled_file_is_not_loaded() {
        let store = store();
        store.files_to_delete.lock().insert("a.json".to_string());

        let mut loader = SchemeLoader::new(&store);
        assert!(loader.load_scheme("a.json", &bytes("A"), false).unwrap().is_none());
        assert!(loader.apply().unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let store = store();
        let mut loader = SchemeLoader::new(&store);
        assert!(matches!(
            loader.load_scheme("a.txt", b"{}", false),
            Err(StoreError::UnknownExtension { .. })
        ));
    }

    #[test]
    fn test_apply_conflicts_when_list_moved() {
        let store = store();
        store.files_to_delete.lock().insert("old.json".to_string());

        let mut loader = SchemeLoader::new(&store);
        loader.load_scheme("a.json", &bytes("A"), false).unwrap();
        assert_eq!(loader.loaded().len(), 1);

        store.add_scheme(store.new_ref("X".to_string()), false).unwrap();

        assert!(matches!(loader.apply(), Err(StoreError::ConcurrentModification)));
        assert_eq!(store.all_scheme_names(), vec!["X".to_string()]);
        assert_eq!(store.files_to_delete(), vec!["old.json".to_string()]);
    }

    #[test]
    fn test_read_only_scheme_is_registered_as_bundled() {
        let store = store();
        let mut loader = SchemeLoader::new(&store);
        let scheme = loader
            .load_scheme("shared.json", &bytes("Shared"), true)
            .unwrap()
            .unwrap();
        loader.apply().unwrap();

        assert!(store.is_bundled(&scheme));
        assert!(!store.is_metadata_editable(&scheme));
    }
}
