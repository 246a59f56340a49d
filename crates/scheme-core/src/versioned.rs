//! Copy-on-write cell with compare-and-swap publication.
//!
//! Readers are wait-free: they load the current snapshot and keep it as long
//! as they need. Writers build a new value from a snapshot and publish it only
//! if nobody else published in between; a lost race is reported as
//! [`Conflict`] and never merged.

use arc_swap::ArcSwap;
use std::sync::Arc;
use thiserror::Error;

/// Another writer published first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("value was modified concurrently")]
pub struct Conflict;

pub struct VersionedCell<T> {
    inner: ArcSwap<T>,
}

impl<T> VersionedCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: ArcSwap::from_pointee(value),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Publish `new` if `current` is still the published snapshot.
    ///
    /// Returns the published value on success.
    pub fn compare_and_swap(&self, current: &Arc<T>, new: T) -> Result<Arc<T>, Conflict> {
        let new = Arc::new(new);
        let previous = self.inner.compare_and_swap(current, Arc::clone(&new));
        if Arc::ptr_eq(&previous, current) {
            Ok(new)
        } else {
            Err(Conflict)
        }
    }
}

impl<T: Default> Default for VersionedCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_from_current_snapshot() {
        let cell = VersionedCell::new(vec![1]);
        let snapshot = cell.load();

        let mut next = (*snapshot).clone();
        next.push(2);
        cell.compare_and_swap(&snapshot, next).unwrap();

        assert_eq!(*cell.load(), vec![1, 2]);
        // old snapshot stays valid for its readers
        assert_eq!(*snapshot, vec![1]);
    }

    #[test]
    fn test_stale_writer_conflicts() {
        let cell = VersionedCell::new(vec![1]);
        let stale = cell.load();

        let fresh = cell.load();
        cell.compare_and_swap(&fresh, vec![1, 2]).unwrap();

        assert_eq!(cell.compare_and_swap(&stale, vec![1, 3]), Err(Conflict));
        assert_eq!(*cell.load(), vec![1, 2]);
    }

    #[test]
    fn test_equal_content_is_not_the_same_snapshot() {
        let cell = VersionedCell::new(vec![1]);
        let snapshot = cell.load();
        cell.compare_and_swap(&snapshot, vec![1]).unwrap();

        // identity of the snapshot matters, not equality of its content
        assert!(cell.compare_and_swap(&snapshot, vec![2]).is_err());
    }
}
