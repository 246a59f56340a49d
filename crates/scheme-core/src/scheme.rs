//! Scheme handles.
//!
//! The store never inspects scheme content. It tracks each scheme through a
//! [`SchemeRef`]: a shared pointer plus a stable id allocated when the scheme
//! was first wrapped. Two refs are the same scheme iff their ids are equal,
//! which is what every identity-keyed map in the store relies on.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stable identity of a scheme instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemeId(u64);

impl SchemeId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SchemeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out scheme ids. One per store.
#[derive(Debug, Default)]
pub(crate) struct SchemeIdAllocator {
    next: AtomicU64,
}

impl SchemeIdAllocator {
    pub(crate) fn allocate(&self) -> SchemeId {
        SchemeId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Shared handle to a scheme owned by a store.
pub struct SchemeRef<S> {
    id: SchemeId,
    scheme: Arc<S>,
}

impl<S> SchemeRef<S> {
    pub(crate) fn new(id: SchemeId, scheme: S) -> Self {
        Self {
            id,
            scheme: Arc::new(scheme),
        }
    }

    pub fn id(&self) -> SchemeId {
        self.id
    }

    pub fn scheme(&self) -> &S {
        &self.scheme
    }

    pub fn arc(&self) -> &Arc<S> {
        &self.scheme
    }
}

impl<S> Clone for SchemeRef<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            scheme: Arc::clone(&self.scheme),
        }
    }
}

impl<S> Deref for SchemeRef<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.scheme
    }
}

impl<S> PartialEq for SchemeRef<S> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<S> Eq for SchemeRef<S> {}

impl<S> Hash for SchemeRef<S> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<S> fmt::Debug for SchemeRef<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SchemeRef").field(&self.id).finish()
    }
}

/// Persistence state reported by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemeState {
    /// Known not to have changed since it was read or written.
    Unchanged,
    /// May have changed; serialized and compared by digest on save.
    Changed,
    /// Never written (e.g. predefined in code).
    NonPersistent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_is_by_id() {
        let ids = SchemeIdAllocator::default();
        let a = SchemeRef::new(ids.allocate(), "same".to_string());
        let b = SchemeRef::new(ids.allocate(), "same".to_string());

        assert_ne!(a, b);
        assert_eq!(a, a.clone());

        let set: HashSet<_> = [a.clone(), a.clone(), b.clone()].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let ids = SchemeIdAllocator::default();
        let first = ids.allocate();
        let second = ids.allocate();
        assert!(first < second);
        assert_eq!(second.to_string(), format!("#{}", second.as_u64()));
    }

    #[test]
    fn test_deref_reaches_scheme() {
        let ids = SchemeIdAllocator::default();
        let scheme = SchemeRef::new(ids.allocate(), String::from("Darcula"));
        assert_eq!(scheme.len(), 7);
        assert_eq!(scheme.scheme(), "Darcula");
    }
}
