//! SchemeStore: the live scheme list and its file-backed persistence.
//!
//! The list is published through a [`VersionedCell`]: readers take a snapshot
//! without locking, structural writers publish with compare-and-swap and fail
//! with [`StoreError::ConcurrentModification`] when they lose a race.
//! Per-scheme metadata, the bundled-scheme registry and the active-scheme
//! state share one mutex. Pending deletions have their own, because a load
//! pass borrows them while a save may be scheduling more.
//!
//! No lock is held while the processor or serializer runs.

use crate::cancel::CancelToken;
use crate::change::{RawEvent, RawEventKind, Requestor, SchemeChangeEvent};
use crate::config::{StoreConfig, DEFAULT_EXTENSION};
use crate::digest::Digest;
use crate::document::DocumentError;
use crate::events::{EventBus, StoreEvent};
use crate::external_info::ExternalInfo;
use crate::fs::{self, FileSystem, FsError};
use crate::loader::SchemeLoader;
use crate::processor::SchemeProcessor;
use crate::provider::StreamProvider;
use crate::reconciler::ChangeEventReconciler;
use crate::scheme::{SchemeId, SchemeIdAllocator, SchemeRef, SchemeState};
use crate::serializer::SchemeSerializer;
use crate::tracker::WriteTracker;
use crate::unique_name::{sanitize_file_name, UniqueNameGenerator};
use crate::versioned::{Conflict, VersionedCell};

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Schemes are already being loaded")]
    AlreadyLoading,

    #[error("Scheme list was modified concurrently")]
    ConcurrentModification,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Scheme name is missing in {file}")]
    NameMissing { file: String },

    #[error("Not a scheme file: {file}")]
    UnknownExtension { file: String },

    #[error("Cannot read scheme {file}: {message}")]
    Read { file: String, message: String },

    #[error(transparent)]
    Save(SaveErrors),
}

impl StoreError {
    /// Cancellation is never logged and swallowed by per-item recovery.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }
}

impl From<Conflict> for StoreError {
    fn from(_: Conflict) -> Self {
        StoreError::ConcurrentModification
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One scheme or file that could not be saved.
#[derive(Debug)]
pub struct SaveFailure {
    /// Scheme key, or path of a file that could not be deleted.
    pub target: String,
    pub error: StoreError,
}

/// Every failure of one `save` call.
#[derive(Debug, Default)]
pub struct SaveErrors {
    failures: Vec<SaveFailure>,
}

impl SaveErrors {
    fn push(&mut self, target: impl Into<String>, error: StoreError) {
        self.failures.push(SaveFailure {
            target: target.into(),
            error,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn failures(&self) -> &[SaveFailure] {
        &self.failures
    }
}

impl fmt::Display for SaveErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to save {} item(s)", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {}", sep, failure.target, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for SaveErrors {}

/// What a successful `save` did.
#[derive(Debug, Clone, Default)]
pub struct SaveReport {
    /// Logical paths written.
    pub written: Vec<String>,
    /// Logical paths deleted.
    pub deleted: Vec<String>,
    /// Raw events matching the mutations, tagged with the store's requestor.
    pub events: Vec<RawEvent>,
}

impl SaveReport {
    pub fn has_changes(&self) -> bool {
        !self.written.is_empty() || !self.deleted.is_empty()
    }
}

pub(crate) enum ActiveScheme<S> {
    Unset,
    /// Waiting for a scheme with this key to appear.
    Pending(String),
    Resolved(SchemeRef<S>),
}

impl<S> ActiveScheme<S> {
    fn resolved(&self) -> Option<&SchemeRef<S>> {
        match self {
            ActiveScheme::Resolved(scheme) => Some(scheme),
            _ => None,
        }
    }
}

pub(crate) struct StoreState<S> {
    pub(crate) infos: HashMap<SchemeId, ExternalInfo>,
    /// Bundled schemes by key. Never written, never scheduled for deletion.
    pub(crate) read_only: HashMap<String, SchemeRef<S>>,
    pub(crate) active: ActiveScheme<S>,
}

impl<S> StoreState<S> {
    pub(crate) fn bundled_ids(&self) -> HashSet<SchemeId> {
        self.read_only.values().map(SchemeRef::id).collect()
    }
}

/// Clears the single-flight flag when a load ends, however it ends.
struct LoadGuard<'a>(&'a AtomicBool);

impl<'a> LoadGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| StoreError::AlreadyLoading)?;
        Ok(Self(flag))
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SchemeStore<S> {
    config: StoreConfig,
    pub(crate) extension: String,
    /// Also read files with `DEFAULT_EXTENSION`.
    upgrade_extension: bool,
    pub(crate) processor: Arc<dyn SchemeProcessor<S>>,
    pub(crate) serializer: Arc<dyn SchemeSerializer<S>>,
    fs: Arc<dyn FileSystem>,
    provider: Option<Arc<dyn StreamProvider>>,
    pub(crate) schemes: VersionedCell<Vec<SchemeRef<S>>>,
    pub(crate) state: Mutex<StoreState<S>>,
    pub(crate) files_to_delete: Mutex<HashSet<String>>,
    /// Managed directory, once seen to exist.
    cached_directory: Mutex<Option<String>>,
    is_loading: AtomicBool,
    ids: SchemeIdAllocator,
    requestor: Requestor,
    cancel: CancelToken,
    events: Arc<EventBus>,
    write_tracker: WriteTracker,
}

impl<S> SchemeStore<S> {
    pub fn new(
        config: StoreConfig,
        processor: Arc<dyn SchemeProcessor<S>>,
        serializer: Arc<dyn SchemeSerializer<S>>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let (extension, upgrade_extension) = match processor.as_extension_provider() {
            Some(provider) => (
                provider.scheme_extension().to_string(),
                provider.is_upgrade_needed() && provider.scheme_extension() != DEFAULT_EXTENSION,
            ),
            None => (DEFAULT_EXTENSION.to_string(), false),
        };

        Self {
            config,
            extension,
            upgrade_extension,
            processor,
            serializer,
            fs,
            provider: None,
            schemes: VersionedCell::new(Vec::new()),
            state: Mutex::new(StoreState {
                infos: HashMap::new(),
                read_only: HashMap::new(),
                active: ActiveScheme::Unset,
            }),
            files_to_delete: Mutex::new(HashSet::new()),
            cached_directory: Mutex::new(None),
            is_loading: AtomicBool::new(false),
            ids: SchemeIdAllocator::default(),
            requestor: Requestor::new(),
            cancel: CancelToken::new(),
            events: Arc::new(EventBus::new()),
            write_tracker: WriteTracker::new(),
        }
    }

    /// Read and write through `provider` wherever it claims applicability.
    pub fn with_provider(mut self, provider: Arc<dyn StreamProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Share a write tracker with the watcher feeding this store.
    pub fn with_write_tracker(mut self, tracker: WriteTracker) -> Self {
        self.write_tracker = tracker;
        self
    }

    // ==================== Accessors ====================

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Scheme file extension, including the dot.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn requestor(&self) -> Requestor {
        self.requestor
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn write_tracker(&self) -> &WriteTracker {
        &self.write_tracker
    }

    /// Wrap a scheme so this store can track it.
    pub fn new_ref(&self, scheme: S) -> SchemeRef<S> {
        SchemeRef::new(self.ids.allocate(), scheme)
    }

    /// Lock-free snapshot of the scheme list.
    pub fn all_schemes(&self) -> Arc<Vec<SchemeRef<S>>> {
        self.schemes.load()
    }

    pub fn all_scheme_names(&self) -> Vec<String> {
        self.schemes
            .load()
            .iter()
            .map(|scheme| self.processor.scheme_key(scheme))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.schemes.load().is_empty()
    }

    /// First scheme with the given key.
    pub fn find_scheme_by_name(&self, name: &str) -> Option<SchemeRef<S>> {
        self.schemes
            .load()
            .iter()
            .find(|scheme| self.processor.scheme_key(scheme) == name)
            .cloned()
    }

    pub fn external_info(&self, scheme: &SchemeRef<S>) -> Option<ExternalInfo> {
        self.state.lock().infos.get(&scheme.id()).cloned()
    }

    /// File the scheme was last read from or written to.
    pub fn file_name(&self, scheme: &SchemeRef<S>) -> Option<String> {
        self.state
            .lock()
            .infos
            .get(&scheme.id())
            .map(ExternalInfo::file_name)
    }

    /// Bundled schemes cannot be renamed or edited in place.
    pub fn is_metadata_editable(&self, scheme: &SchemeRef<S>) -> bool {
        !self.is_bundled(scheme)
    }

    /// Pending deletions, sorted.
    pub fn files_to_delete(&self) -> Vec<String> {
        let mut files: Vec<String> = self.files_to_delete.lock().iter().cloned().collect();
        files.sort();
        files
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading.load(Ordering::Acquire)
    }

    pub(crate) fn is_bundled(&self, scheme: &SchemeRef<S>) -> bool {
        self.state
            .lock()
            .read_only
            .values()
            .any(|bundled| bundled == scheme)
    }

    pub(crate) fn bundled_ids(&self) -> HashSet<SchemeId> {
        self.state.lock().bundled_ids()
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    // ==================== Active scheme ====================

    pub fn active_scheme(&self) -> Option<SchemeRef<S>> {
        self.state.lock().active.resolved().cloned()
    }

    /// Key of the active scheme, or the pending name waiting to resolve.
    pub fn current_scheme_name(&self) -> Option<String> {
        let active = match &self.state.lock().active {
            ActiveScheme::Unset => return None,
            ActiveScheme::Pending(name) => return Some(name.clone()),
            ActiveScheme::Resolved(scheme) => scheme.clone(),
        };
        Some(self.processor.scheme_key(&active))
    }

    pub(crate) fn pending_scheme_name(&self) -> Option<String> {
        match &self.state.lock().active {
            ActiveScheme::Pending(name) => Some(name.clone()),
            _ => None,
        }
    }

    /// Make the scheme with key `name` active, now or as soon as it is loaded.
    pub fn set_current_scheme_name(&self, name: &str, notify: bool) {
        match self.find_scheme_by_name(name) {
            Some(scheme) => self.set_current(Some(&scheme), notify, false),
            None => self.state.lock().active = ActiveScheme::Pending(name.to_string()),
        }
    }

    /// Resolve the active scheme. The processor hears about it only when the
    /// identity changes.
    pub fn set_current(&self, scheme: Option<&SchemeRef<S>>, notify: bool, synchronous: bool) {
        let old = {
            let mut state = self.state.lock();
            let old = state.active.resolved().cloned();
            state.active = match scheme {
                Some(scheme) => ActiveScheme::Resolved(scheme.clone()),
                None => ActiveScheme::Unset,
            };
            old
        };
        if notify && old.as_ref() != scheme {
            self.processor
                .on_current_scheme_switched(old.as_ref(), scheme, synchronous);
        }
    }

    /// Fire exactly one switch notification from `old` to `new`.
    ///
    /// With no successor the store keeps waiting for `old`'s key.
    pub(crate) fn switch_active(&self, old: Option<&SchemeRef<S>>, new: Option<&SchemeRef<S>>) {
        if let Some(new) = new {
            self.state.lock().active = ActiveScheme::Resolved(new.clone());
        }
        self.processor.on_current_scheme_switched(old, new, false);
    }

    /// Resolve a pending name against freshly loaded schemes, first match wins.
    fn resolve_pending_name(&self, loaded: &[SchemeRef<S>]) {
        let Some(pending) = self.pending_scheme_name() else {
            return;
        };
        if let Some(found) = loaded
            .iter()
            .find(|scheme| self.processor.scheme_key(scheme) == pending)
        {
            self.set_current(Some(found), true, false);
        }
    }

    /// Demote the active scheme to a pending name if `is_removed` says it left
    /// the list.
    pub(crate) fn demote_active_if(&self, is_removed: impl Fn(&SchemeRef<S>) -> bool) {
        let Some(active) = self.active_scheme() else {
            return;
        };
        if !is_removed(&active) {
            return;
        }
        let key = self.processor.scheme_key(&active);
        let mut state = self.state.lock();
        if state.active.resolved() == Some(&active) {
            debug!("Active scheme {} removed, waiting for it to reappear", key);
            state.active = ActiveScheme::Pending(key);
        }
    }

    // ==================== File naming & access ====================

    /// Split `file_name` into stem and extension if it is a scheme file name.
    pub(crate) fn split_scheme_file_name<'n>(&self, file_name: &'n str) -> Option<(&'n str, &'n str)> {
        let split = |extension: &str| {
            file_name
                .strip_suffix(extension)
                .map(|stem| (stem, &file_name[stem.len()..]))
        };
        split(self.extension.as_str()).or_else(|| {
            if self.upgrade_extension {
                split(DEFAULT_EXTENSION)
            } else {
                None
            }
        })
    }

    /// Whether `file_name` is read by this store.
    pub fn can_read(&self, file_name: &str) -> bool {
        self.split_scheme_file_name(file_name).is_some() && self.processor.is_scheme_file(file_name)
    }

    pub(crate) fn provider_for(&self, path: &str) -> Option<&Arc<dyn StreamProvider>> {
        self.provider
            .as_ref()
            .filter(|provider| provider.is_applicable(path, self.config.roaming_type))
    }

    /// The managed directory on the local filesystem, if it exists.
    pub(crate) fn resolve_directory(&self) -> Result<Option<String>> {
        if let Some(dir) = self.cached_directory.lock().clone() {
            return Ok(Some(dir));
        }
        let dir = self.config.directory.clone();
        if !self.fs.exists(&dir)? {
            return Ok(None);
        }
        *self.cached_directory.lock() = Some(dir.clone());
        Ok(Some(dir))
    }

    pub(crate) fn clear_cached_directory(&self) {
        self.cached_directory.lock().take();
    }

    /// Current bytes of one scheme file, `None` if it is gone.
    pub(crate) fn read_scheme_file(&self, file_name: &str) -> Result<Option<Vec<u8>>> {
        let dir = self.config.directory.as_str();
        if let Some(provider) = self.provider_for(dir) {
            let mut found = None;
            provider.process_children(
                dir,
                self.config.roaming_type,
                &|name: &str| name == file_name,
                &mut |_name: &str, bytes: &[u8], _read_only: bool| {
                    found = Some(bytes.to_vec());
                    false
                },
            )?;
            return Ok(found);
        }
        match self.fs.read(&fs::join_path(dir, file_name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of the readable scheme files currently in the managed directory.
    pub(crate) fn list_scheme_files(&self) -> Result<Vec<String>> {
        let dir = self.config.directory.as_str();
        let mut names = Vec::new();
        if let Some(provider) = self.provider_for(dir) {
            provider.process_children(
                dir,
                self.config.roaming_type,
                &|name: &str| self.can_read(name),
                &mut |name: &str, _bytes: &[u8], _read_only: bool| {
                    names.push(name.to_string());
                    true
                },
            )?;
            return Ok(names);
        }
        let entries = match self.fs.list(dir) {
            Ok(entries) => entries,
            Err(FsError::NotFound(_)) => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        names.extend(
            entries
                .into_iter()
                .filter(|entry| !entry.is_dir && self.can_read(&entry.name))
                .map(|entry| entry.name),
        );
        names.sort();
        Ok(names)
    }

    pub(crate) fn find_scheme_by_file_name(&self, file_name: &str) -> Option<SchemeRef<S>> {
        let snapshot = self.schemes.load();
        let state = self.state.lock();
        let bundled = state.bundled_ids();
        snapshot
            .iter()
            .find(|scheme| {
                !bundled.contains(&scheme.id())
                    && state
                        .infos
                        .get(&scheme.id())
                        .is_some_and(|info| info.file_name() == file_name)
            })
            .cloned()
    }

    pub(crate) fn update_digest(&self, scheme: &SchemeRef<S>, digest: Digest) {
        if let Some(info) = self.state.lock().infos.get_mut(&scheme.id()) {
            info.set_digest(digest);
        }
    }

    // ==================== Loading ====================

    /// Read every scheme file of the managed directory.
    ///
    /// Fails with [`StoreError::AlreadyLoading`] when called while another
    /// load is running, including from a processor callback of that load.
    pub fn load_schemes(&self) -> Result<Vec<SchemeRef<S>>> {
        let _guard = LoadGuard::acquire(&self.is_loading)?;

        let mut loader = SchemeLoader::new(self);
        self.read_all(&mut loader)?;
        let loaded = loader.apply()?;

        let total = self.schemes.load().len();
        info!(
            "Loaded {} schemes from {} ({} total)",
            loaded.len(),
            self.config.name(),
            total
        );
        self.events.emit(StoreEvent::SchemesLoaded {
            directory: self.config.directory.clone(),
            loaded: loaded.len(),
            total,
        });

        self.resolve_pending_name(&loaded);
        Ok(loaded)
    }

    /// Feed the loader from the provider if it serves the directory, else from
    /// the local filesystem. Never both.
    fn read_all(&self, loader: &mut SchemeLoader<'_, S>) -> Result<()> {
        let dir = self.config.directory.as_str();

        if let Some(provider) = self.provider_for(dir) {
            let mut interrupted = None;
            let result = provider.process_children(
                dir,
                self.config.roaming_type,
                &|name: &str| self.can_read(name),
                &mut |name: &str, bytes: &[u8], read_only: bool| {
                    if self.cancel.is_cancelled() {
                        interrupted = Some(StoreError::Cancelled);
                        return false;
                    }
                    if let Err(e) = loader.load_scheme(name, bytes, read_only) {
                        if e.is_cancelled() {
                            interrupted = Some(e);
                            return false;
                        }
                        warn!("Cannot read scheme {} from {}: {}", name, self.config.name(), e);
                    }
                    true
                },
            );
            if let Some(e) = interrupted {
                return Err(e);
            }
            if let Err(e) = result {
                warn!("Stopped reading {} from provider: {}", dir, e);
            }
            return Ok(());
        }

        let Some(dir) = self.resolve_directory()? else {
            debug!("Scheme directory {} does not exist", dir);
            return Ok(());
        };
        let mut entries = match self.fs.list(&dir) {
            Ok(entries) => entries,
            Err(FsError::NotFound(_)) => {
                self.clear_cached_directory();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        for entry in entries {
            if entry.is_dir || !self.can_read(&entry.name) {
                continue;
            }
            self.check_cancelled()?;
            let result = self
                .fs
                .read(&fs::join_path(&dir, &entry.name))
                .map_err(StoreError::from)
                .and_then(|bytes| loader.load_scheme(&entry.name, &bytes, false));
            if let Err(e) = result {
                if e.is_cancelled() {
                    return Err(e);
                }
                warn!(
                    "Cannot read scheme {} from {}: {}",
                    entry.name,
                    self.config.name(),
                    e
                );
            }
        }
        Ok(())
    }

    /// Register a read-only default shipped with the application.
    ///
    /// A user scheme with the same key shadows it in the list; the bundled
    /// instance stays registered for digest comparison on save.
    pub fn load_bundled_scheme(&self, file_name: &str, bytes: &[u8]) -> Result<SchemeRef<S>> {
        let (stem, extension) = match file_name.rfind('.') {
            Some(pos) if pos > 0 => (&file_name[..pos], Some(&file_name[pos..])),
            _ => (file_name, None),
        };

        let document = self.serializer.parse(bytes)?;
        let key = self
            .serializer
            .extract_key(&document)
            .or_else(|| {
                self.processor
                    .as_lazy()
                    .and_then(|lazy| lazy.scheme_key(bytes, stem))
            })
            .unwrap_or_else(|| stem.to_string());
        if key.is_empty() {
            return Err(StoreError::NameMissing {
                file: file_name.to_string(),
            });
        }

        let scheme = self.serializer.deserialize(document, &key, true).map_err(|e| {
            StoreError::Read {
                file: file_name.to_string(),
                message: e.to_string(),
            }
        })?;
        let scheme = self.new_ref(scheme);
        let mut info = ExternalInfo::new(stem, extension);
        info.set_scheme_key(self.processor.scheme_key(&scheme));

        let previous = self.state.lock().read_only.get(&key).cloned();
        let snapshot = self.schemes.load();
        let mut list = (*snapshot).clone();
        match previous
            .as_ref()
            .and_then(|previous| list.iter().position(|s| s == previous))
        {
            Some(index) => list[index] = scheme.clone(),
            None if list.iter().any(|s| self.processor.scheme_key(s) == key) => {
                debug!("Bundled scheme {} is shadowed by a user scheme", key);
            }
            None => list.push(scheme.clone()),
        }
        self.schemes.compare_and_swap(&snapshot, list)?;

        {
            let mut state = self.state.lock();
            if let Some(previous) = state.read_only.insert(key.clone(), scheme.clone()) {
                debug!("Bundled scheme {} registered twice, keeping the last", key);
                state.infos.remove(&previous.id());
            }
            state.infos.insert(scheme.id(), info);
        }

        self.resolve_pending_name(std::slice::from_ref(&scheme));
        Ok(scheme)
    }

    /// Re-read the directory.
    ///
    /// Non-persistent schemes and those rejected by `retain` leave the list
    /// first, without their files being scheduled for deletion.
    pub fn reload(&self, retain: Option<&dyn Fn(&S) -> bool>) -> Result<Vec<SchemeRef<S>>> {
        self.processor.before_reloaded();

        let snapshot = self.schemes.load();
        let bundled = self.bundled_ids();
        let (kept, evicted): (Vec<_>, Vec<_>) = snapshot.iter().cloned().partition(|scheme| {
            bundled.contains(&scheme.id())
                || (self.processor.state(scheme) != SchemeState::NonPersistent
                    && retain.is_none_or(|retain| retain(scheme.scheme())))
        });
        if !evicted.is_empty() {
            debug!("Evicting {} schemes before reload", evicted.len());
            self.schemes.compare_and_swap(&snapshot, kept)?;
            self.demote_active_if(|active| evicted.contains(active));
            self.retain_external_info(false);
        }

        let loaded = self.load_schemes()?;
        let all = self.schemes.load();
        self.processor.reloaded(&all);
        Ok(loaded)
    }

    // ==================== Structural mutation ====================

    /// Add a scheme. A scheme with the same key is replaced when
    /// `replace_existing` is set or the new scheme is not externalizable;
    /// otherwise the duplicate is appended.
    pub fn add_scheme(&self, scheme: SchemeRef<S>, replace_existing: bool) -> Result<()> {
        let key = self.processor.scheme_key(&scheme);
        let snapshot = self.schemes.load();
        let mut list = (*snapshot).clone();

        let mut replaced = None;
        match list
            .iter()
            .position(|existing| self.processor.scheme_key(existing) == key)
        {
            Some(index) if list[index] == scheme => return Ok(()),
            Some(index) if replace_existing || !self.processor.is_externalizable(&scheme) => {
                replaced = Some(std::mem::replace(&mut list[index], scheme.clone()));
            }
            Some(_) => {
                debug!("Scheme {} already exists in {}, adding duplicate", key, self.config.name());
                list.push(scheme.clone());
            }
            None => list.push(scheme.clone()),
        }
        self.schemes.compare_and_swap(&snapshot, list)?;

        let file_name = {
            let mut state = self.state.lock();
            if let Some(old) = &replaced {
                let old_is_bundled = state.read_only.values().any(|bundled| bundled == old);
                if !old_is_bundled {
                    // the replacement takes over the file
                    if let Some(info) = state.infos.remove(&old.id()) {
                        state.infos.entry(scheme.id()).or_insert(info);
                    }
                }
            }
            state.infos.get(&scheme.id()).map(ExternalInfo::file_name)
        };
        if let Some(file_name) = file_name {
            self.files_to_delete.lock().remove(&file_name);
        }

        let replaced_active = replaced
            .as_ref()
            .is_some_and(|old| self.active_scheme().as_ref() == Some(old));
        if replaced_active || self.pending_scheme_name().as_deref() == Some(key.as_str()) {
            self.set_current(Some(&scheme), true, false);
        }
        Ok(())
    }

    /// Remove a scheme and schedule its file for deletion on the next save.
    pub fn remove_scheme(&self, scheme: &SchemeRef<S>) -> Result<bool> {
        self.remove_from_list(scheme, true)
    }

    pub fn remove_scheme_by_name(&self, name: &str) -> Result<Option<SchemeRef<S>>> {
        let Some(scheme) = self.find_scheme_by_name(name) else {
            return Ok(None);
        };
        self.remove_scheme(&scheme)?;
        Ok(Some(scheme))
    }

    /// Drop the scheme read from `file_name` after the file itself vanished.
    pub(crate) fn remove_scheme_by_file_name(&self, file_name: &str) -> Result<Option<SchemeRef<S>>> {
        self.files_to_delete.lock().remove(file_name);
        let Some(scheme) = self.find_scheme_by_file_name(file_name) else {
            debug!("No scheme is backed by {}", file_name);
            return Ok(None);
        };
        self.remove_from_list(&scheme, false)?;
        self.processor.on_scheme_deleted(&scheme);
        Ok(Some(scheme))
    }

    fn remove_from_list(&self, scheme: &SchemeRef<S>, schedule_delete: bool) -> Result<bool> {
        let key = self.processor.scheme_key(scheme);
        let snapshot = self.schemes.load();
        let Some(index) = snapshot.iter().position(|s| s == scheme) else {
            return Ok(false);
        };
        let mut list = (*snapshot).clone();
        list.remove(index);

        let shadowed = self.state.lock().read_only.get(&key).cloned();
        let is_bundled = shadowed.as_ref() == Some(scheme);
        // a removed user scheme uncovers the bundled default it shadowed
        if let Some(bundled) = shadowed.filter(|_| !is_bundled) {
            let still_shadowed = list.iter().any(|s| self.processor.scheme_key(s) == key);
            if !still_shadowed && !list.contains(&bundled) {
                list.insert(index, bundled);
            }
        }

        // bookkeeping only changes once the list is published
        self.schemes.compare_and_swap(&snapshot, list)?;
        if !is_bundled {
            let info = self.state.lock().infos.remove(&scheme.id());
            if let Some(info) = info.filter(|_| schedule_delete) {
                info.schedule_delete(&mut self.files_to_delete.lock(), "removed");
            }
        }
        self.demote_active_if(|active| active == scheme);
        Ok(true)
    }

    /// Replace the whole list.
    ///
    /// With a `remove_condition`, existing schemes it rejects are dropped and
    /// the rest kept in front of `new_schemes`. Infos of schemes that left are
    /// scheduled for deletion. Without an explicit `new_current`, the first
    /// remaining scheme becomes active if the active one left.
    pub fn set_schemes(
        &self,
        new_schemes: Vec<SchemeRef<S>>,
        new_current: Option<&SchemeRef<S>>,
        remove_condition: Option<&dyn Fn(&S) -> bool>,
    ) -> Result<()> {
        let snapshot = self.schemes.load();
        let mut list: Vec<SchemeRef<S>> = match remove_condition {
            Some(remove) => snapshot
                .iter()
                .filter(|scheme| !remove(scheme.scheme()))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        list.extend(new_schemes);

        let old_active = self.active_scheme();
        let published = self.schemes.compare_and_swap(&snapshot, list)?;
        self.retain_external_info(true);

        let new_active = match (new_current, &old_active) {
            (Some(current), _) => Some(current.clone()),
            (None, Some(old)) if !published.contains(old) => published.first().cloned(),
            (None, old) => old.clone(),
        };
        {
            let mut state = self.state.lock();
            match &new_active {
                Some(active) => state.active = ActiveScheme::Resolved(active.clone()),
                None if old_active.is_some() => state.active = ActiveScheme::Unset,
                None => {}
            }
        }
        if old_active != new_active {
            self.processor
                .on_current_scheme_switched(old_active.as_ref(), new_active.as_ref(), false);
        }
        Ok(())
    }

    /// Drop infos of schemes no longer in the list, optionally scheduling
    /// their files. Files of live schemes are unscheduled.
    pub(crate) fn retain_external_info(&self, schedule_delete: bool) {
        let live: HashSet<SchemeId> = self.schemes.load().iter().map(SchemeRef::id).collect();
        let mut state = self.state.lock();
        let bundled = state.bundled_ids();
        let mut files = self.files_to_delete.lock();
        state.infos.retain(|id, info| {
            if bundled.contains(id) {
                return true;
            }
            if live.contains(id) {
                files.remove(&info.file_name());
                return true;
            }
            if schedule_delete {
                info.schedule_delete(&mut files, "requested to delete");
            }
            false
        });
    }

    /// The managed directory vanished: drop every file-backed scheme.
    ///
    /// Bundled and non-persistent schemes stay; bundled defaults shadowed by a
    /// removed scheme come back.
    pub(crate) fn remove_externalizable_schemes(&self) -> Result<Vec<SchemeRef<S>>> {
        self.clear_cached_directory();
        let snapshot = self.schemes.load();
        let (bundled_ids, bundled) = {
            let state = self.state.lock();
            let bundled: Vec<SchemeRef<S>> = state.read_only.values().cloned().collect();
            (state.bundled_ids(), bundled)
        };

        let (mut kept, removed): (Vec<_>, Vec<_>) = snapshot.iter().cloned().partition(|scheme| {
            bundled_ids.contains(&scheme.id())
                || !self.processor.is_externalizable(scheme)
                || self.processor.state(scheme) == SchemeState::NonPersistent
        });
        if removed.is_empty() {
            return Ok(removed);
        }
        for default in bundled {
            let key = self.processor.scheme_key(&default);
            let present = kept.iter().any(|s| self.processor.scheme_key(s) == key);
            if !present {
                kept.push(default);
            }
        }

        self.schemes.compare_and_swap(&snapshot, kept)?;
        self.demote_active_if(|active| removed.contains(active));
        self.retain_external_info(false);
        for scheme in &removed {
            self.processor.on_scheme_deleted(scheme);
        }
        Ok(removed)
    }

    /// Apply a batch of raw change notifications.
    pub fn apply_changes(&self, batch: &[RawEvent]) -> Result<Vec<SchemeChangeEvent>> {
        ChangeEventReconciler::new(self).reconcile(batch)
    }

    // ==================== Saving ====================

    /// Write every changed scheme and delete every scheduled file.
    ///
    /// Per-scheme failures are collected and returned together as
    /// [`StoreError::Save`] after all schemes were attempted. Cancellation
    /// returns immediately.
    pub fn save(&self) -> Result<SaveReport> {
        if self.is_loading() {
            warn!("Skip saving {}: schemes are being loaded", self.config.name());
            return Ok(SaveReport::default());
        }

        let schemes = self.schemes.load();
        let bundled = self.bundled_ids();
        let mut name_generator = UniqueNameGenerator::new();
        let mut changed = Vec::new();
        let mut has_schemes = false;

        for scheme in schemes.iter() {
            if bundled.contains(&scheme.id()) || !self.processor.is_externalizable(scheme) {
                continue;
            }
            let state = self.processor.state(scheme);
            if state == SchemeState::NonPersistent {
                continue;
            }
            has_schemes = true;
            if state != SchemeState::Unchanged {
                changed.push(scheme.clone());
            }
            if let Some(info) = self.external_info(scheme) {
                if !info.is_renamed(&self.processor.scheme_key(scheme)) {
                    name_generator.add_existing_name(info.file_name_without_extension());
                }
            }
        }

        let scheduled = self.files_to_delete.lock().clone();
        let mut to_delete = scheduled.clone();
        let mut report = SaveReport::default();
        let mut errors = SaveErrors::default();

        for scheme in &changed {
            self.check_cancelled()?;
            if let Err(e) = self.save_scheme(scheme, &mut name_generator, &mut to_delete, &mut report) {
                if e.is_cancelled() {
                    return Err(e);
                }
                let key = self.processor.scheme_key(scheme);
                warn!("Cannot save scheme {} in {}: {}", key, self.config.name(), e);
                errors.push(key, e);
            }
        }

        if !scheduled.is_empty() {
            let mut live = self.files_to_delete.lock();
            for name in &scheduled {
                live.remove(name);
            }
        }
        if !to_delete.is_empty() {
            self.state
                .lock()
                .infos
                .retain(|id, info| bundled.contains(id) || !to_delete.contains(&info.file_name()));
            self.delete_files(&to_delete, &mut report, &mut errors)?;
        }

        if !has_schemes && self.provider_for(&self.config.directory).is_none() {
            self.remove_directory_if_empty(&mut report);
        }

        if report.has_changes() {
            info!(
                "Saved {}: {} written, {} deleted",
                self.config.name(),
                report.written.len(),
                report.deleted.len()
            );
        }
        if errors.is_empty() {
            Ok(report)
        } else {
            Err(StoreError::Save(errors))
        }
    }

    /// Write one scheme if it changed.
    ///
    /// The target file is taken off `to_delete` before the unchanged and
    /// equal-to-bundled checks, so a pending deletion of that name is dropped
    /// even when nothing ends up written over it.
    fn save_scheme(
        &self,
        scheme: &SchemeRef<S>,
        name_generator: &mut UniqueNameGenerator,
        to_delete: &mut HashSet<String>,
        report: &mut SaveReport,
    ) -> Result<()> {
        let key = self.processor.scheme_key(scheme);
        let old_info = self.external_info(scheme);

        let document = match self.serializer.serialize(scheme)? {
            Some(document) if !document.is_empty() => document,
            _ => {
                if let Some(info) = &old_info {
                    info.schedule_delete(to_delete, "empty");
                }
                return Ok(());
            }
        };

        let renamed = old_info.as_ref().is_some_and(|info| info.is_renamed(&key));
        let stem = match &old_info {
            Some(info) if !renamed => info.file_name_without_extension().to_string(),
            _ => name_generator.generate_unique_name(&sanitize_file_name(&key)),
        };
        let file_name = format!("{}{}", stem, self.extension);
        // the file is about to be rewritten
        to_delete.remove(&file_name);

        let bytes = document.to_bytes()?;
        let digest = self.serializer.digest(&bytes);

        if let Some(info) = &old_info {
            let same_file = !renamed && info.file_extension() == Some(self.extension.as_str());
            if same_file && info.is_digest_equals(&digest) {
                return Ok(());
            }
        }
        if self.is_equal_to_bundled(&key, scheme, &digest)? {
            if let Some(info) = &old_info {
                info.schedule_delete(to_delete, "equals to bundled");
            }
            return Ok(());
        }
        if self.processor.is_scheme_default(scheme, &digest) {
            if let Some(info) = &old_info {
                info.schedule_delete(to_delete, "equals to default");
            }
            return Ok(());
        }

        let path = fs::join_path(&self.config.directory, &file_name);
        let existed = old_info
            .as_ref()
            .is_some_and(|info| info.file_name() == file_name);
        self.write_file(&path, &bytes, existed, report)?;

        if let Some(info) = &old_info {
            if info.file_name() != file_name {
                if info.file_name_without_extension() != stem {
                    // keep the old file if another scheme now claims its name
                    if name_generator.is_unique(info.file_name_without_extension()) {
                        info.schedule_delete(to_delete, "renamed");
                    }
                } else {
                    info.schedule_delete(to_delete, "extension upgraded");
                }
            }
        }

        let mut info = old_info.unwrap_or_else(|| ExternalInfo::new(&stem, Some(self.extension.as_str())));
        info.set_file_name_without_extension(&stem, &self.extension);
        info.set_digest(digest);
        info.set_scheme_key(key);
        self.state.lock().infos.insert(scheme.id(), info);
        Ok(())
    }

    fn is_equal_to_bundled(&self, key: &str, scheme: &SchemeRef<S>, digest: &Digest) -> Result<bool> {
        let bundled = self.state.lock().read_only.get(key).cloned();
        match bundled {
            Some(bundled) if bundled != *scheme => Ok(self.bundled_digest(&bundled)? == *digest),
            Some(_) => Ok(false),
            None => Ok(self
                .processor
                .as_lazy()
                .is_some_and(|lazy| lazy.is_scheme_equal_to_bundled(scheme))),
        }
    }

    /// Digest of a bundled scheme, computed on first use.
    fn bundled_digest(&self, bundled: &SchemeRef<S>) -> Result<Digest> {
        let cached = self
            .state
            .lock()
            .infos
            .get(&bundled.id())
            .and_then(|info| info.digest().copied());
        if let Some(digest) = cached {
            return Ok(digest);
        }

        let bytes = match self.serializer.serialize(bundled)? {
            Some(document) => document.to_bytes()?,
            None => Vec::new(),
        };
        let digest = self.serializer.digest(&bytes);
        self.update_digest(bundled, digest);
        Ok(digest)
    }

    fn write_file(&self, path: &str, bytes: &[u8], existed: bool, report: &mut SaveReport) -> Result<()> {
        let via_provider = match self.provider_for(path) {
            Some(provider) => {
                provider.write(path, bytes, self.config.roaming_type)?;
                true
            }
            None => {
                let dir = self.config.directory.as_str();
                if !dir.is_empty() && !self.fs.exists(dir)? {
                    self.write_tracker.mark_written(dir);
                    report
                        .events
                        .push(RawEvent::directory(RawEventKind::Created, dir).with_requestor(self.requestor));
                }
                self.write_tracker.mark_written(path);
                if let Err(e) = self.fs.write(path, bytes) {
                    self.write_tracker.consume_written(path);
                    return Err(e.into());
                }
                false
            }
        };

        let kind = if existed {
            RawEventKind::ContentChanged
        } else {
            RawEventKind::Created
        };
        report
            .events
            .push(RawEvent::file(kind, path).with_requestor(self.requestor));
        report.written.push(path.to_string());
        debug!("Wrote scheme file {}", path);
        self.events.emit(StoreEvent::SchemeWritten {
            path: path.to_string(),
            via_provider,
        });
        Ok(())
    }

    fn delete_files(
        &self,
        names: &HashSet<String>,
        report: &mut SaveReport,
        errors: &mut SaveErrors,
    ) -> Result<()> {
        let mut names: Vec<&String> = names.iter().collect();
        names.sort();

        for name in names {
            self.check_cancelled()?;
            let path = fs::join_path(&self.config.directory, name);
            match self.delete_file(&path) {
                Ok(true) => {
                    debug!("Deleted scheme file {}", path);
                    report
                        .events
                        .push(RawEvent::file(RawEventKind::Deleted, &path).with_requestor(self.requestor));
                    self.events.emit(StoreEvent::SchemeFileDeleted { path: path.clone() });
                    report.deleted.push(path);
                }
                Ok(false) => debug!("Scheme file {} is already gone", path),
                Err(e) => {
                    warn!("Cannot delete scheme file {}: {}", path, e);
                    errors.push(path, e.into());
                }
            }
        }
        Ok(())
    }

    /// Returns `false` if there was nothing to delete.
    fn delete_file(&self, path: &str) -> fs::Result<bool> {
        if let Some(provider) = self.provider_for(path) {
            if provider.delete(path, self.config.roaming_type)? {
                return Ok(true);
            }
        }
        self.write_tracker.mark_written(path);
        match self.fs.delete(path) {
            Ok(()) => Ok(true),
            Err(FsError::NotFound(_)) => {
                self.write_tracker.consume_written(path);
                Ok(false)
            }
            Err(e) => {
                self.write_tracker.consume_written(path);
                Err(e)
            }
        }
    }

    fn remove_directory_if_empty(&self, report: &mut SaveReport) {
        let dir = self.config.directory.as_str();
        if dir.is_empty() {
            return;
        }
        match self.fs.list(dir) {
            Ok(entries) if entries.is_empty() => {}
            _ => return,
        }
        self.write_tracker.mark_written(dir);
        match self.fs.delete(dir) {
            Ok(()) => {
                debug!("Removed empty scheme directory {}", dir);
                self.clear_cached_directory();
                report
                    .events
                    .push(RawEvent::directory(RawEventKind::Deleted, dir).with_requestor(self.requestor));
            }
            Err(e) => {
                self.write_tracker.consume_written(dir);
                debug!("Cannot remove scheme directory {}: {}", dir, e);
            }
        }
    }
}
