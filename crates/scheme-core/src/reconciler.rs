//! ChangeEventReconciler: applies batches of external file notifications.
//!
//! A batch is translated into [`SchemeChangeEvent`]s, coalesced by
//! [`sort_scheme_change_events`], and replayed against the store. Removals
//! mutate the store directly. Additions and updates share one lazily created
//! [`SchemeLoader`], applied once at the end of the batch.

use crate::change::{RawEvent, RawEventKind, SchemeChangeEvent, SchemeFile};
use crate::events::StoreEvent;
use crate::fs;
use crate::loader::SchemeLoader;
use crate::store::{Result, SchemeStore, StoreError};

use once_cell::unsync::OnceCell;
use std::cell::RefCell;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Coalesce one batch.
///
/// Scanning from the end: a `RemoveAllSchemes` drops everything before it; a
/// removal followed by an add or update of the same file is obsolete, and so
/// is an add or update followed by its removal; of several adds and updates
/// of one file only the last is kept. If any removal survives, removals are
/// moved in front of the rest, each group keeping its order.
pub fn sort_scheme_change_events(events: Vec<SchemeChangeEvent>) -> Vec<SchemeChangeEvent> {
    if events.len() < 2 {
        return events;
    }

    let mut removed: HashSet<String> = HashSet::new();
    let mut touched: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(events.len());

    for event in events.into_iter().rev() {
        if event == SchemeChangeEvent::RemoveAllSchemes {
            kept.push(event);
            break;
        }
        let obsolete = match &event {
            SchemeChangeEvent::RemoveScheme(name) => {
                touched.contains(name) || !removed.insert(name.clone())
            }
            SchemeChangeEvent::UpdateScheme(file) | SchemeChangeEvent::AddScheme(file) => {
                removed.contains(&file.name) || !touched.insert(file.name.clone())
            }
            SchemeChangeEvent::RemoveAllSchemes => false,
        };
        if !obsolete {
            kept.push(event);
        }
    }
    kept.reverse();

    if kept
        .iter()
        .any(|event| matches!(event, SchemeChangeEvent::RemoveScheme(_)))
    {
        let (mut removals, rest): (Vec<_>, Vec<_>) =
            kept.into_iter().partition(SchemeChangeEvent::is_removal);
        removals.extend(rest);
        removals
    } else {
        kept
    }
}

pub struct ChangeEventReconciler<'a, S> {
    store: &'a SchemeStore<S>,
}

type LazyLoader<'a, S> = OnceCell<RefCell<SchemeLoader<'a, S>>>;

impl<'a, S> ChangeEventReconciler<'a, S> {
    pub fn new(store: &'a SchemeStore<S>) -> Self {
        Self { store }
    }

    /// Translate, coalesce and apply one batch. Returns the events applied.
    pub fn reconcile(&self, batch: &[RawEvent]) -> Result<Vec<SchemeChangeEvent>> {
        let events = self.to_scheme_events(batch)?;
        if events.is_empty() {
            return Ok(events);
        }
        let events = sort_scheme_change_events(events);
        self.apply_events(&events)?;
        Ok(events)
    }

    /// Map raw notifications to scheme events, dropping the store's own.
    pub fn to_scheme_events(&self, batch: &[RawEvent]) -> Result<Vec<SchemeChangeEvent>> {
        let store = self.store;
        let dir = store.config().directory.as_str();
        let mut events = Vec::new();

        for raw in batch {
            // a tagged echo still clears the mark so a later native event
            // for the same path is not taken for our own
            let marked = store.write_tracker().consume_written(&raw.path);
            if raw.requestor == Some(store.requestor()) {
                continue;
            }
            if marked {
                debug!("Ignoring own change to {}", raw.path);
                continue;
            }

            let path = raw.path.trim_matches('/');
            if raw.is_directory {
                if path != dir {
                    continue;
                }
                match raw.kind {
                    RawEventKind::Deleted => events.push(SchemeChangeEvent::RemoveAllSchemes),
                    RawEventKind::Created => {
                        // the whole directory was replaced
                        store.clear_cached_directory();
                        for name in store.list_scheme_files()? {
                            events.push(SchemeChangeEvent::AddScheme(SchemeFile::new(name)));
                        }
                    }
                    RawEventKind::ContentChanged => {}
                }
                continue;
            }

            let (parent, name) = fs::split_path(path);
            if parent != dir || !store.can_read(name) {
                continue;
            }
            events.push(match raw.kind {
                RawEventKind::ContentChanged => SchemeChangeEvent::UpdateScheme(SchemeFile::new(name)),
                RawEventKind::Created => SchemeChangeEvent::AddScheme(SchemeFile::new(name)),
                RawEventKind::Deleted => SchemeChangeEvent::RemoveScheme(name.to_string()),
            });
        }
        Ok(events)
    }

    /// Replay coalesced events in order.
    ///
    /// The processor hears at most one active-scheme switch per call: the
    /// scheme that replaced the old active one by key, or, if nothing was
    /// active, the newly loaded scheme matching the pending name.
    pub fn apply_events(&self, events: &[SchemeChangeEvent]) -> Result<()> {
        let store = self.store;
        let old_active = store.active_scheme();
        let old_active_key = old_active
            .as_ref()
            .map(|scheme| store.processor.scheme_key(scheme));

        let loader: LazyLoader<'a, S> = OnceCell::new();
        for event in events {
            store.check_cancelled()?;
            let result = match event {
                SchemeChangeEvent::RemoveAllSchemes => {
                    store.remove_externalizable_schemes().map(|_| ())
                }
                SchemeChangeEvent::RemoveScheme(name) => {
                    store.remove_scheme_by_file_name(name).map(|_| ())
                }
                SchemeChangeEvent::UpdateScheme(file) => self.update_scheme(file, &loader),
                SchemeChangeEvent::AddScheme(file) => self.add_scheme(file, &loader),
            };
            if let Err(e) = result {
                if e.is_cancelled() || matches!(e, StoreError::ConcurrentModification) {
                    return Err(e);
                }
                warn!("Cannot apply {:?} to {}: {}", event, store.config().name(), e);
            }
        }

        let loaded = match loader.into_inner() {
            Some(loader) => loader.into_inner().apply()?,
            None => Vec::new(),
        };

        let new_active = match &old_active {
            None => store.pending_scheme_name().and_then(|pending| {
                loaded
                    .iter()
                    .find(|scheme| store.processor.scheme_key(scheme) == pending)
                    .cloned()
            }),
            Some(old) => {
                let schemes = store.all_schemes();
                if schemes.contains(old) {
                    Some(old.clone())
                } else {
                    old_active_key.and_then(|key| {
                        schemes
                            .iter()
                            .find(|scheme| store.processor.scheme_key(scheme) == key)
                            .cloned()
                    })
                }
            }
        };
        if new_active != old_active {
            store.switch_active(old_active.as_ref(), new_active.as_ref());
        }

        info!(
            "Applied {} scheme changes to {}",
            events.len(),
            store.config().name()
        );
        store.events().emit(StoreEvent::ChangesApplied {
            directory: store.config().directory.clone(),
            events: events.len(),
        });
        Ok(())
    }

    fn loader<'c>(&self, cell: &'c LazyLoader<'a, S>) -> &'c RefCell<SchemeLoader<'a, S>> {
        cell.get_or_init(|| RefCell::new(SchemeLoader::new(self.store)))
    }

    fn add_scheme(&self, file: &SchemeFile, cell: &LazyLoader<'a, S>) -> Result<()> {
        let Some(bytes) = self.store.read_scheme_file(&file.name)? else {
            debug!("Scheme file {} vanished before it was read", file.name);
            return Ok(());
        };
        self.loader(cell)
            .borrow_mut()
            .load_scheme(&file.name, &bytes, false)?;
        Ok(())
    }

    fn update_scheme(&self, file: &SchemeFile, cell: &LazyLoader<'a, S>) -> Result<()> {
        let store = self.store;
        let Some(bytes) = store.read_scheme_file(&file.name)? else {
            debug!("Scheme file {} vanished before it was read", file.name);
            return Ok(());
        };

        let existing = store.find_scheme_by_file_name(&file.name);
        let handler = store.processor.as_content_changed_handler();
        if let (Some(handler), Some(existing)) = (handler, existing.as_ref()) {
            let document = store.serializer.parse(&bytes)?;
            let key = store
                .serializer
                .extract_key(&document)
                .unwrap_or_else(|| store.processor.scheme_key(existing));
            let digest = store.serializer.digest(&document.to_bytes()?);
            handler.scheme_content_changed(existing, &key, &document);
            store.update_digest(existing, digest);
            debug!("Scheme {} updated in place from {}", key, file.name);
            return Ok(());
        }

        // the loader replaces whatever was read from this file before
        self.loader(cell)
            .borrow_mut()
            .load_scheme(&file.name, &bytes, false)?;
        Ok(())
    }
}
