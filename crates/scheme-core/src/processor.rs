//! Scheme processor contract.
//!
//! The processor is the store's only window into what a scheme means: it
//! names schemes, reports their persistence state, and receives lifecycle
//! callbacks. Optional behavior lives in capability traits that a processor
//! exposes through the `as_*` accessors instead of being detected by type.
//!
//! Callbacks are invoked without any store lock held, so they may call back
//! into the store.

use crate::digest::Digest;
use crate::document::Document;
use crate::scheme::{SchemeRef, SchemeState};

pub trait SchemeProcessor<S>: Send + Sync {
    /// Identity key (usually the display name) of a scheme.
    fn scheme_key(&self, scheme: &S) -> String;

    /// Whether the scheme is stored in a file at all.
    fn is_externalizable(&self, _scheme: &S) -> bool {
        true
    }

    fn state(&self, _scheme: &S) -> SchemeState {
        SchemeState::Changed
    }

    /// Whether `scheme` equals the processor's built-in default, in which case
    /// no user file is kept for it.
    fn is_scheme_default(&self, _scheme: &S, _digest: &Digest) -> bool {
        false
    }

    /// Extra filter on top of the extension check.
    fn is_scheme_file(&self, _file_name: &str) -> bool {
        true
    }

    fn on_scheme_added(&self, _scheme: &SchemeRef<S>) {}

    fn on_scheme_deleted(&self, _scheme: &SchemeRef<S>) {}

    fn on_current_scheme_switched(
        &self,
        _old: Option<&SchemeRef<S>>,
        _new: Option<&SchemeRef<S>>,
        _synchronous: bool,
    ) {
    }

    fn before_reloaded(&self) {}

    fn reloaded(&self, _new_schemes: &[SchemeRef<S>]) {}

    fn as_lazy(&self) -> Option<&dyn LazySchemeProcessor<S>> {
        None
    }

    fn as_content_changed_handler(&self) -> Option<&dyn SchemeContentChangedHandler<S>> {
        None
    }

    fn as_extension_provider(&self) -> Option<&dyn SchemeExtensionProvider> {
        None
    }
}

/// Processors that can name a scheme without a `name` attribute and know
/// their bundled defaults.
pub trait LazySchemeProcessor<S>: Send + Sync {
    /// Key for a file whose document carries no name. `None` rejects the file.
    fn scheme_key(&self, bytes: &[u8], file_name_without_extension: &str) -> Option<String> {
        let _ = bytes;
        Some(file_name_without_extension.to_string())
    }

    /// Whether `scheme` matches a bundled default the store has no copy of.
    fn is_scheme_equal_to_bundled(&self, _scheme: &S) -> bool {
        false
    }
}

/// Processors that update a scheme in place when its file changes, instead
/// of having it replaced by a freshly read instance.
pub trait SchemeContentChangedHandler<S>: Send + Sync {
    fn scheme_content_changed(&self, scheme: &SchemeRef<S>, key: &str, document: &Document);
}

/// Processors with their own file extension.
pub trait SchemeExtensionProvider: Send + Sync {
    /// Extension including the dot, e.g. `.icls`.
    fn scheme_extension(&self) -> &str;

    /// Also read files with the default extension, upgrading them on save.
    fn is_upgrade_needed(&self) -> bool {
        false
    }
}
