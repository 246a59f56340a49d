//! scheme-core: keeps named, user-editable configuration objects ("schemes")
//! in sync between an in-memory list, a directory of files, and a stream of
//! external change notifications.
//!
//! This crate provides:
//! - `SchemeStore`, the aggregate owning the scheme list and its persistence
//! - `SchemeLoader`, a one-shot load pass
//! - `ChangeEventReconciler`, which coalesces and applies file notifications
//! - Collaborator traits (serializer, processor, filesystem, stream provider)
//!   and in-memory implementations for tests

pub mod cancel;
pub mod change;
pub mod config;
pub mod digest;
pub mod document;
pub mod events;
pub mod external_info;
pub mod fs;
pub mod loader;
pub mod processor;
pub mod provider;
pub mod reconciler;
pub mod scheme;
pub mod serializer;
pub mod store;
pub mod tracker;
pub mod unique_name;
pub mod versioned;

pub use cancel::CancelToken;
pub use change::{RawEvent, RawEventKind, Requestor, SchemeChangeEvent, SchemeFile};
pub use config::{StoreConfig, DEFAULT_EXTENSION};
pub use digest::Digest;
pub use document::{Document, DocumentError};
pub use events::{EventBus, StoreEvent, Subscription};
pub use external_info::ExternalInfo;
pub use fs::{FileEntry, FileSystem, FsError, InMemoryFs};
pub use loader::SchemeLoader;
pub use processor::{
    LazySchemeProcessor, SchemeContentChangedHandler, SchemeExtensionProvider, SchemeProcessor,
};
pub use provider::{InMemoryProvider, RoamingType, StreamProvider};
pub use reconciler::{sort_scheme_change_events, ChangeEventReconciler};
pub use scheme::{SchemeId, SchemeRef, SchemeState};
pub use serializer::SchemeSerializer;
pub use store::{SaveErrors, SaveFailure, SaveReport, SchemeStore, StoreError};
pub use tracker::WriteTracker;
pub use unique_name::{sanitize_file_name, UniqueNameGenerator};
pub use versioned::{Conflict, VersionedCell};
